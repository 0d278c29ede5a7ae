use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::workflows::receipts::domain::{CustomerPhone, ReceiptId, StoreId};
use crate::workflows::rewards::domain::{RewardId, VisitId};

/// Customer-facing event handed to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LoyaltyEvent {
    #[serde(rename_all = "camelCase")]
    ReceiptAccepted {
        customer_phone: CustomerPhone,
        receipt_id: ReceiptId,
        visit_id: VisitId,
    },
    #[serde(rename_all = "camelCase")]
    ReceiptRejected {
        customer_phone: CustomerPhone,
        receipt_id: ReceiptId,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    ManualReviewComplete {
        customer_phone: CustomerPhone,
        receipt_id: ReceiptId,
        approved: bool,
    },
    #[serde(rename_all = "camelCase")]
    RewardMilestone {
        customer_phone: CustomerPhone,
        store_id: StoreId,
        visits_in_period: u32,
        visits_needed: u32,
    },
    #[serde(rename_all = "camelCase")]
    RewardAvailable {
        customer_phone: CustomerPhone,
        store_id: StoreId,
        reward_id: RewardId,
        reward_code: String,
    },
}

impl LoyaltyEvent {
    pub fn template(&self) -> &'static str {
        match self {
            LoyaltyEvent::ReceiptAccepted { .. } => "receiptAccepted",
            LoyaltyEvent::ReceiptRejected { .. } => "receiptRejected",
            LoyaltyEvent::ManualReviewComplete { .. } => "manualReviewComplete",
            LoyaltyEvent::RewardMilestone { .. } => "rewardMilestone",
            LoyaltyEvent::RewardAvailable { .. } => "rewardAvailable",
        }
    }

    pub fn customer_phone(&self) -> &CustomerPhone {
        match self {
            LoyaltyEvent::ReceiptAccepted { customer_phone, .. }
            | LoyaltyEvent::ReceiptRejected { customer_phone, .. }
            | LoyaltyEvent::ManualReviewComplete { customer_phone, .. }
            | LoyaltyEvent::RewardMilestone { customer_phone, .. }
            | LoyaltyEvent::RewardAvailable { customer_phone, .. } => customer_phone,
        }
    }
}

/// Notification dispatch error.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}

/// Outbound notification hook (push, WhatsApp, webhook adapters).
pub trait Notifier: Send + Sync {
    fn publish(&self, event: LoyaltyEvent) -> Result<(), NotifyError>;
}

/// Fire-and-forget delivery: failures are logged, never propagated to the caller.
pub fn dispatch<N: Notifier + ?Sized>(notifier: &N, events: Vec<LoyaltyEvent>) {
    for event in events {
        let template = event.template();
        if let Err(err) = notifier.publish(event) {
            warn!(%err, template, "notification dropped");
        }
    }
}

/// Notifier used when no delivery collaborator is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, event: LoyaltyEvent) -> Result<(), NotifyError> {
        info!(
            template = event.template(),
            customer = %event.customer_phone(),
            "notification"
        );
        Ok(())
    }
}
