use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use super::common::*;
use crate::workflows::receipts::extraction::{PresetExtractor, PresetFraudScorer};
use crate::workflows::receipts::router::{
    receipt_router, UploadParams, REVIEWER_ID_HEADER, REVIEWER_ROLE_HEADER,
    REVIEWER_STORE_HEADER,
};
use crate::workflows::receipts::service::{Collaborators, ReceiptService};

fn router(harness: &Harness) -> Router {
    receipt_router(harness.service.clone())
}

fn upload_request(receipt_id: &str) -> Request<Body> {
    Request::post(format!(
        "/api/v1/receipts?phone=%2B15550100&store_id={STORE}&receipt_id={receipt_id}"
    ))
    .header(header::CONTENT_TYPE, "image/jpeg")
    .body(Body::from(vec![0xFF, 0xD8, 0xFF]))
    .unwrap()
}

fn review_request(
    receipt_id: &str,
    role: Option<(&str, Option<&str>)>,
    body: Value,
) -> Request<Body> {
    let mut builder = Request::post(format!("/api/v1/review/{receipt_id}"))
        .header(header::CONTENT_TYPE, "application/json");
    if let Some((role, store)) = role {
        builder = builder
            .header(REVIEWER_ID_HEADER, "reviewer-1")
            .header(REVIEWER_ROLE_HEADER, role);
        if let Some(store) = store {
            builder = builder.header(REVIEWER_STORE_HEADER, store);
        }
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn flag(harness: &Harness, receipt_id: &str) {
    harness.prime(receipt_id, clean_extraction(receipt_id, start()), risk(50, &["glare"]));
    let response = router(harness)
        .oneshot(upload_request(receipt_id))
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn upload_route_returns_outcome() {
    let harness = harness();
    harness.prime_clean("r1");

    let response = router(&harness)
        .oneshot(upload_request("r1"))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json_body(response).await;
    assert_eq!(payload["status"], "approved");
    assert_eq!(payload["receiptId"], "r1");
    assert_eq!(payload["visitCount"], 1);
    assert_eq!(payload["rewardEarned"], false);
    assert!(payload.get("rejectionDetails").is_none());
}

#[tokio::test]
async fn upload_route_requires_an_image() {
    let harness = harness();

    let response = router(&harness)
        .oneshot(
            Request::post("/api/v1/receipts?phone=%2B15550100")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn upload_route_reports_rejection_details() {
    let harness = harness();
    let mut extraction = clean_extraction("r1", start());
    extraction.total_amount = Some(2.0);
    harness.prime("r1", extraction, low_risk());

    let response = router(&harness)
        .oneshot(upload_request("r1"))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json_body(response).await;
    assert_eq!(payload["status"], "rejected");
    assert_eq!(payload["rejectionDetails"][0]["field"], "total_amount");
}

#[tokio::test]
async fn resubmission_is_a_conflict() {
    let harness = harness();
    harness.prime_clean("r1");
    router(&harness)
        .oneshot(upload_request("r1"))
        .await
        .expect("route executes");

    let response = router(&harness)
        .oneshot(upload_request("r1"))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let payload = read_json_body(response).await;
    assert_eq!(payload["receiptId"], "r1");
    assert_eq!(payload["status"], "approved");
    assert_eq!(visit_count(&harness.repository), 1);
}

#[tokio::test]
async fn upstream_outage_is_retryable() {
    let (service, repository) = service_with(Arc::new(OfflineExtractor));
    let response = receipt_router(Arc::new(service))
        .oneshot(upload_request("r1"))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let payload = read_json_body(response).await;
    assert_eq!(payload["receiptId"], "r1");
    assert_eq!(payload["status"], "pending");
    assert_eq!(payload["retryable"], true);
    assert_eq!(visit_count(&repository), 0);
}

#[tokio::test]
async fn status_route_reports_visit_and_missing_receipts() {
    let harness = harness();
    harness.prime_clean("r1");
    router(&harness)
        .oneshot(upload_request("r1"))
        .await
        .expect("route executes");

    let response = router(&harness)
        .oneshot(Request::get("/api/v1/receipts/r1").body(Body::empty()).unwrap())
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json_body(response).await;
    assert_eq!(payload["status"], "approved");
    assert_eq!(payload["visitCount"], 1);
    assert!(payload.get("visitId").is_some());

    let missing = router(&harness)
        .oneshot(Request::get("/api/v1/receipts/nope").body(Body::empty()).unwrap())
        .await
        .expect("route executes");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn escalation_route_checks_ownership() {
    let harness = harness();
    flag(&harness, "r1").await;

    let stranger = router(&harness)
        .oneshot(
            Request::post("/api/v1/receipts/r1/escalate")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"phone":"+15559999"}"#))
                .unwrap(),
        )
        .await
        .expect("route executes");
    assert_eq!(stranger.status(), StatusCode::FORBIDDEN);

    let owner = router(&harness)
        .oneshot(
            Request::post("/api/v1/receipts/r1/escalate")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"phone":"+1 555 0100"}"#))
                .unwrap(),
        )
        .await
        .expect("route executes");
    assert_eq!(owner.status(), StatusCode::OK);
    let payload = read_json_body(owner).await;
    assert_eq!(payload["status"], "flagged_manual_requested");
}

#[tokio::test]
async fn review_route_requires_reviewer_headers() {
    let harness = harness();
    flag(&harness, "r1").await;

    let response = router(&harness)
        .oneshot(review_request("r1", None, json!({ "action": "approve" })))
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router(&harness)
        .oneshot(review_request(
            "r1",
            Some(("store_admin", None)),
            json!({ "action": "approve" }),
        ))
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn review_route_enforces_store_scope() {
    let harness = harness();
    flag(&harness, "r1").await;

    let response = router(&harness)
        .oneshot(review_request(
            "r1",
            Some(("store_admin", Some(OTHER_STORE))),
            json!({ "action": "approve" }),
        ))
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(visit_count(&harness.repository), 0);
}

#[tokio::test]
async fn review_route_applies_decisions() {
    let harness = harness();
    flag(&harness, "r1").await;
    flag(&harness, "r2").await;

    let approved = router(&harness)
        .oneshot(review_request(
            "r1",
            Some(("super_admin", None)),
            json!({ "action": "approve", "notes": "legible on zoom" }),
        ))
        .await
        .expect("route executes");
    assert_eq!(approved.status(), StatusCode::OK);
    let payload = read_json_body(approved).await;
    assert_eq!(payload["status"], "approved");
    assert_eq!(payload["visitCount"], 1);

    let unexplained = router(&harness)
        .oneshot(review_request(
            "r2",
            Some(("store_admin", Some(STORE))),
            json!({ "action": "reject" }),
        ))
        .await
        .expect("route executes");
    assert_eq!(unexplained.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let again = router(&harness)
        .oneshot(review_request(
            "r1",
            Some(("super_admin", None)),
            json!({ "action": "reject", "reason": "changed my mind" }),
        ))
        .await
        .expect("route executes");
    assert_eq!(again.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn queue_and_detail_routes_list_flagged_receipts() {
    let harness = harness();
    flag(&harness, "r1").await;

    let response = router(&harness)
        .oneshot(
            Request::get("/api/v1/review?limit=10")
                .header(REVIEWER_ID_HEADER, "reviewer-1")
                .header(REVIEWER_ROLE_HEADER, "store_admin")
                .header(REVIEWER_STORE_HEADER, STORE)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json_body(response).await;
    let receipts = payload["receipts"].as_array().expect("receipt list");
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0]["id"], "r1");

    let detail = router(&harness)
        .oneshot(
            Request::get("/api/v1/review/r1")
                .header(REVIEWER_ID_HEADER, "reviewer-1")
                .header(REVIEWER_ROLE_HEADER, "super_admin")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("route executes");
    assert_eq!(detail.status(), StatusCode::OK);
    let payload = read_json_body(detail).await;
    assert_eq!(payload["comparison"]["tinMatches"], true);
    assert_eq!(payload["fraud"]["overall"], 50);
}

#[tokio::test]
async fn upload_handler_maps_repository_outage() {
    let service = Arc::new(ReceiptService::new(
        Arc::new(UnavailableRepository),
        Arc::new(MemoryNotifier::default()),
        Collaborators {
            extractor: Arc::new(PresetExtractor::new()),
            scorer: Arc::new(PresetFraudScorer::new(low_risk())),
        },
        &pipeline_config(),
    ));

    let response = crate::workflows::receipts::router::upload_handler::<
        UnavailableRepository,
        MemoryNotifier,
    >(
        State(service),
        Query(UploadParams {
            phone: PHONE.to_string(),
            store_id: Some(STORE.to_string()),
            receipt_id: Some("r1".to_string()),
            name: None,
        }),
        HeaderMap::new(),
        Bytes::from_static(&[0xFF, 0xD8]),
    )
    .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
