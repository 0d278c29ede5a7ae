use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use super::domain::{CustomerPhone, ReceiptId, ReceiptImage, ReceiptUpload, StoreId};
use super::review::{ReviewRequest, Reviewer};
use super::service::{ReceiptService, ReceiptServiceError};
use crate::notify::Notifier;
use crate::storage::{LoyaltyRepository, RepositoryError};
use crate::workflows::rewards::accrual::AccrualError;
use crate::workflows::rewards::ledger::LedgerError;

const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_QUEUE_LIMIT: usize = 50;

pub const REVIEWER_ID_HEADER: &str = "x-reviewer-id";
pub const REVIEWER_ROLE_HEADER: &str = "x-reviewer-role";
pub const REVIEWER_STORE_HEADER: &str = "x-reviewer-store";

/// Router exposing receipt upload, status, escalation and review endpoints.
pub fn receipt_router<R, N>(service: Arc<ReceiptService<R, N>>) -> Router
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    Router::new()
        .route("/api/v1/receipts", post(upload_handler::<R, N>))
        .route("/api/v1/receipts/:receipt_id", get(status_handler::<R, N>))
        .route(
            "/api/v1/receipts/:receipt_id/escalate",
            post(escalate_handler::<R, N>),
        )
        .route("/api/v1/review", get(queue_handler::<R, N>))
        .route(
            "/api/v1/review/:receipt_id",
            get(detail_handler::<R, N>).post(review_handler::<R, N>),
        )
        .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES))
        .with_state(service)
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadParams {
    pub phone: String,
    #[serde(default)]
    pub store_id: Option<String>,
    #[serde(default)]
    pub receipt_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EscalationRequest {
    pub phone: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueueParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub(crate) async fn upload_handler<R, N>(
    State(service): State<Arc<ReceiptService<R, N>>>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    if body.is_empty() {
        let payload = json!({ "error": "receipt image is required" });
        return (StatusCode::UNPROCESSABLE_ENTITY, axum::Json(payload)).into_response();
    }

    let receipt_id = params
        .receipt_id
        .filter(|id| !id.trim().is_empty())
        .map(|id| ReceiptId(id.trim().to_string()))
        .unwrap_or_else(ReceiptId::generate);
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let upload = ReceiptUpload {
        customer_phone: CustomerPhone::normalized(&params.phone),
        customer_name: params.name.filter(|name| !name.trim().is_empty()),
        store_id: params
            .store_id
            .filter(|id| !id.trim().is_empty())
            .map(StoreId),
        image: ReceiptImage {
            reference: format!("receipts/{receipt_id}"),
            content_type,
            bytes: body.to_vec(),
        },
        receipt_id: Some(receipt_id),
    };

    match service.submit(upload).await {
        Ok(outcome) => (StatusCode::OK, axum::Json(outcome)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn status_handler<R, N>(
    State(service): State<Arc<ReceiptService<R, N>>>,
    Path(receipt_id): Path<String>,
) -> Response
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    match service.status(&ReceiptId(receipt_id)) {
        Ok(outcome) => (StatusCode::OK, axum::Json(outcome)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn escalate_handler<R, N>(
    State(service): State<Arc<ReceiptService<R, N>>>,
    Path(receipt_id): Path<String>,
    axum::Json(request): axum::Json<EscalationRequest>,
) -> Response
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    let customer = CustomerPhone::normalized(&request.phone);
    match service.request_manual_review(&ReceiptId(receipt_id), &customer) {
        Ok(outcome) => (StatusCode::OK, axum::Json(outcome)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn queue_handler<R, N>(
    State(service): State<Arc<ReceiptService<R, N>>>,
    headers: HeaderMap,
    Query(params): Query<QueueParams>,
) -> Response
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    let reviewer = match reviewer_from_headers(&headers) {
        Ok(reviewer) => reviewer,
        Err(response) => return response,
    };
    let limit = params.limit.unwrap_or(DEFAULT_QUEUE_LIMIT);
    match service.review_queue(&reviewer, limit) {
        Ok(receipts) => (StatusCode::OK, axum::Json(json!({ "receipts": receipts }))).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn detail_handler<R, N>(
    State(service): State<Arc<ReceiptService<R, N>>>,
    headers: HeaderMap,
    Path(receipt_id): Path<String>,
) -> Response
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    let reviewer = match reviewer_from_headers(&headers) {
        Ok(reviewer) => reviewer,
        Err(response) => return response,
    };
    match service.review_detail(&ReceiptId(receipt_id), &reviewer) {
        Ok(detail) => (StatusCode::OK, axum::Json(detail)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn review_handler<R, N>(
    State(service): State<Arc<ReceiptService<R, N>>>,
    headers: HeaderMap,
    Path(receipt_id): Path<String>,
    axum::Json(request): axum::Json<ReviewRequest>,
) -> Response
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    let reviewer = match reviewer_from_headers(&headers) {
        Ok(reviewer) => reviewer,
        Err(response) => return response,
    };
    match service.review(&ReceiptId(receipt_id), &reviewer, request) {
        Ok(outcome) => (StatusCode::OK, axum::Json(outcome)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Reviewer identity as forwarded by the authenticating gateway.
pub(crate) fn reviewer_from_headers(headers: &HeaderMap) -> Result<Reviewer, Response> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let unauthenticated = |message: &str| {
        let payload = json!({ "error": message });
        (StatusCode::UNAUTHORIZED, axum::Json(payload)).into_response()
    };

    let Some(id) = header_value(REVIEWER_ID_HEADER) else {
        return Err(unauthenticated("missing reviewer identity"));
    };

    match header_value(REVIEWER_ROLE_HEADER) {
        Some("super_admin") => Ok(Reviewer::super_admin(id)),
        Some("store_admin") => match header_value(REVIEWER_STORE_HEADER) {
            Some(store) => Ok(Reviewer::store_admin(id, StoreId(store.to_string()))),
            None => Err(unauthenticated("store admins must carry a store")),
        },
        _ => Err(unauthenticated("unknown reviewer role")),
    }
}

pub(crate) fn error_response(err: ReceiptServiceError) -> Response {
    let (status, payload) = match &err {
        ReceiptServiceError::AlreadyProcessed { receipt_id, status } => (
            StatusCode::CONFLICT,
            json!({
                "error": err.to_string(),
                "receiptId": receipt_id,
                "status": status,
            }),
        ),
        ReceiptServiceError::UpstreamUnavailable { receipt_id, .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "error": err.to_string(),
                "receiptId": receipt_id,
                "status": "pending",
                "retryable": true,
            }),
        ),
        ReceiptServiceError::Ledger(LedgerError::DuplicateVisit(_))
        | ReceiptServiceError::Accrual(AccrualError::DuplicateReward { .. })
        | ReceiptServiceError::Repository(RepositoryError::Conflict(_))
        | ReceiptServiceError::Transition(_) => {
            (StatusCode::CONFLICT, json!({ "error": err.to_string() }))
        }
        ReceiptServiceError::Unauthorized(_) => {
            (StatusCode::FORBIDDEN, json!({ "error": err.to_string() }))
        }
        ReceiptServiceError::ReceiptNotFound(_)
        | ReceiptServiceError::StoreNotFound(_)
        | ReceiptServiceError::Repository(RepositoryError::NotFound) => {
            (StatusCode::NOT_FOUND, json!({ "error": err.to_string() }))
        }
        ReceiptServiceError::InvalidRequest(_) | ReceiptServiceError::UploadsDisabled(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "error": err.to_string() }),
        ),
        ReceiptServiceError::Repository(RepositoryError::Unavailable(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "error": err.to_string() }),
        ),
        ReceiptServiceError::Ledger(_) | ReceiptServiceError::Accrual(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": err.to_string() }),
        ),
    };
    (status, axum::Json(payload)).into_response()
}
