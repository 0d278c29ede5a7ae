use chrono::Duration;

use super::common::*;
use crate::clock::Clock;
use crate::notify::LoyaltyEvent;
use crate::workflows::receipts::domain::{ReceiptId, ReceiptStatus, StoreId};
use crate::workflows::receipts::review::{ReviewRequest, Reviewer};
use crate::workflows::receipts::service::ReceiptServiceError;

fn id(value: &str) -> ReceiptId {
    ReceiptId(value.to_string())
}

fn admin() -> Reviewer {
    Reviewer::super_admin("root")
}

fn harbor_admin() -> Reviewer {
    Reviewer::store_admin("harbor-manager", store_id())
}

fn deli_admin() -> Reviewer {
    Reviewer::store_admin("deli-manager", StoreId(OTHER_STORE.to_string()))
}

/// Submits a receipt the fraud scorer sends to review.
async fn flagged(harness: &Harness, receipt: &str) {
    let now = harness.clock.now();
    harness.prime(receipt, clean_extraction(receipt, now), risk(55, &["glare"]));
    let outcome = harness
        .service
        .submit(upload(receipt, Some(STORE)))
        .await
        .expect("evaluated");
    assert_eq!(outcome.status, ReceiptStatus::Flagged);
}

/// Submits a receipt whose store nobody could determine.
async fn storeless(harness: &Harness, receipt: &str) {
    let now = harness.clock.now();
    let mut extraction = clean_extraction(receipt, now);
    extraction.tax_id = None;
    harness.prime(receipt, extraction, low_risk());
    let outcome = harness
        .service
        .submit(upload(receipt, None))
        .await
        .expect("evaluated");
    assert_eq!(outcome.status, ReceiptStatus::Flagged);
}

#[tokio::test]
async fn approval_credits_the_visit() {
    let harness = harness();
    flagged(&harness, "r1").await;

    let outcome = harness
        .service
        .review(&id("r1"), &harbor_admin(), ReviewRequest::approve())
        .expect("approved");

    assert_eq!(outcome.status, ReceiptStatus::Approved);
    assert_eq!(outcome.visit_count, Some(1));
    assert_eq!(visit_count(&harness.repository), 1);

    let receipt = harness.service.get(&id("r1")).expect("stored");
    let stamp = receipt.review.expect("review stamped");
    assert_eq!(stamp.reviewer_id.0, "harbor-manager");
    assert_eq!(
        harness.notifier.templates(),
        vec!["manualReviewComplete", "rewardMilestone"]
    );
}

#[tokio::test]
async fn second_decision_is_refused() {
    let harness = harness();
    flagged(&harness, "r1").await;
    harness
        .service
        .review(&id("r1"), &admin(), ReviewRequest::approve())
        .expect("approved");

    let err = harness
        .service
        .review(&id("r1"), &admin(), ReviewRequest::approve())
        .expect_err("already decided");
    assert!(matches!(
        err,
        ReceiptServiceError::AlreadyProcessed {
            status: ReceiptStatus::Approved,
            ..
        }
    ));
    assert_eq!(visit_count(&harness.repository), 1);
}

#[tokio::test]
async fn rejection_requires_a_reason() {
    let harness = harness();
    flagged(&harness, "r1").await;

    let err = harness
        .service
        .review(&id("r1"), &admin(), ReviewRequest::reject("  "))
        .expect_err("reason required");
    assert!(matches!(err, ReceiptServiceError::InvalidRequest(_)));
    assert_eq!(
        harness.service.get(&id("r1")).expect("stored").status,
        ReceiptStatus::Flagged
    );

    let outcome = harness
        .service
        .review(&id("r1"), &admin(), ReviewRequest::reject("photo of a screen"))
        .expect("rejected");
    assert_eq!(outcome.status, ReceiptStatus::Rejected);
    assert_eq!(outcome.reason, "photo of a screen");
    assert_eq!(visit_count(&harness.repository), 0);
    assert!(matches!(
        harness.notifier.events().last(),
        Some(LoyaltyEvent::ManualReviewComplete {
            approved: false,
            ..
        })
    ));
}

#[tokio::test]
async fn store_admins_are_scoped_to_their_store() {
    let harness = harness();
    flagged(&harness, "r1").await;

    let err = harness
        .service
        .review(&id("r1"), &deli_admin(), ReviewRequest::approve())
        .expect_err("other store");
    assert!(matches!(err, ReceiptServiceError::Unauthorized(_)));
    assert!(matches!(
        harness.service.review_detail(&id("r1"), &deli_admin()),
        Err(ReceiptServiceError::Unauthorized(_))
    ));
    assert_eq!(visit_count(&harness.repository), 0);
}

#[tokio::test]
async fn storeless_receipts_need_a_super_admin_assignment() {
    let harness = harness();
    storeless(&harness, "r1").await;

    assert!(matches!(
        harness
            .service
            .review(&id("r1"), &harbor_admin(), ReviewRequest::approve()),
        Err(ReceiptServiceError::Unauthorized(_))
    ));
    assert!(matches!(
        harness
            .service
            .review(&id("r1"), &admin(), ReviewRequest::approve()),
        Err(ReceiptServiceError::InvalidRequest(_))
    ));

    let unknown = ReviewRequest {
        store_id: Some(StoreId("store-missing".to_string())),
        ..ReviewRequest::approve()
    };
    assert!(matches!(
        harness.service.review(&id("r1"), &admin(), unknown),
        Err(ReceiptServiceError::StoreNotFound(_))
    ));

    let assign = ReviewRequest {
        store_id: Some(store_id()),
        notes: Some("branch stamp matches harbor".to_string()),
        ..ReviewRequest::approve()
    };
    let outcome = harness
        .service
        .review(&id("r1"), &admin(), assign)
        .expect("approved with assignment");
    assert_eq!(outcome.status, ReceiptStatus::Approved);

    let receipt = harness.service.get(&id("r1")).expect("stored");
    assert_eq!(receipt.store_id, Some(store_id()));
    assert_eq!(
        receipt.review.and_then(|stamp| stamp.notes).as_deref(),
        Some("branch stamp matches harbor")
    );
}

#[tokio::test]
async fn escalated_receipts_can_still_be_reviewed() {
    let harness = harness();
    flagged(&harness, "r1").await;
    harness
        .service
        .request_manual_review(&id("r1"), &phone())
        .expect("escalated");

    let outcome = harness
        .service
        .review(&id("r1"), &harbor_admin(), ReviewRequest::approve())
        .expect("approved");
    assert_eq!(outcome.status, ReceiptStatus::Approved);
}

#[tokio::test]
async fn queue_lists_escalations_first_within_scope() {
    let harness = harness();
    flagged(&harness, "r1").await;
    harness.clock.advance(Duration::minutes(5));
    flagged(&harness, "r2").await;
    harness.clock.advance(Duration::minutes(5));
    storeless(&harness, "r3").await;
    harness
        .service
        .request_manual_review(&id("r2"), &phone())
        .expect("escalated");

    let queue: Vec<String> = harness
        .service
        .review_queue(&admin(), 10)
        .expect("queue")
        .into_iter()
        .map(|receipt| receipt.id.0)
        .collect();
    assert_eq!(queue, vec!["r2", "r1", "r3"]);

    let scoped: Vec<String> = harness
        .service
        .review_queue(&harbor_admin(), 10)
        .expect("queue")
        .into_iter()
        .map(|receipt| receipt.id.0)
        .collect();
    assert_eq!(scoped, vec!["r2", "r1"]);

    assert!(harness
        .service
        .review_queue(&deli_admin(), 10)
        .expect("queue")
        .is_empty());
    assert_eq!(
        harness
            .service
            .review_queue(&admin(), 1)
            .expect("queue")
            .len(),
        1
    );
}

#[tokio::test]
async fn detail_compares_receipt_with_store_rules() {
    let harness = harness();
    let mut extraction = clean_extraction("r1", start());
    extraction.tax_id = Some("100-200-399".to_string());
    extraction.total_amount = None;
    harness.prime("r1", extraction, low_risk());
    let outcome = harness
        .service
        .submit(upload("r1", Some(STORE)))
        .await
        .expect("evaluated");
    assert_eq!(outcome.status, ReceiptStatus::Flagged);

    let detail = harness
        .service
        .review_detail(&id("r1"), &harbor_admin())
        .expect("detail");
    assert_eq!(detail.failures.len(), 2);
    let comparison = detail.comparison.expect("store known");
    assert!(!comparison.tin_matches);
    assert_eq!(comparison.found_tin.as_deref(), Some("100-200-399"));
    assert_eq!(comparison.branch_matches, Some(true));
    assert_eq!(comparison.amount_meets_minimum, None);
    assert_eq!(comparison.within_validity_window, Some(true));
}
