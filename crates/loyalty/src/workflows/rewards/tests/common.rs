use std::sync::{Arc, Mutex};

use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::clock::ManualClock;
use crate::notify::{LoyaltyEvent, Notifier, NotifyError};
use crate::storage::InMemoryRepository;
use crate::workflows::receipts::domain::{CustomerPhone, StoreId, StoreReceiptConfig};
use crate::workflows::rewards::accrual::AccrualPolicy;
use crate::workflows::rewards::domain::{Reward, RewardRule};
use crate::workflows::rewards::service::{QrCheckIn, RewardService, StaffMember};

pub(super) const STORE: &str = "store-bakery";
pub(super) const OTHER_STORE: &str = "store-florist";
pub(super) const PHONE: &str = "+15550177";

pub(super) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap()
}

pub(super) fn store_id() -> StoreId {
    StoreId(STORE.to_string())
}

pub(super) fn phone() -> CustomerPhone {
    CustomerPhone(PHONE.to_string())
}

fn store(id: &str, name: &str) -> StoreReceiptConfig {
    StoreReceiptConfig {
        store_id: StoreId(id.to_string()),
        name: name.to_string(),
        tin: format!("TIN-{id}"),
        branch_name: None,
        min_receipt_amount: 0.0,
        receipt_validity_hours: 24,
        uploads_enabled: true,
    }
}

pub(super) fn check_in() -> QrCheckIn {
    QrCheckIn {
        phone: PHONE.to_string(),
        store_id: store_id(),
        name: Some("Sam".to_string()),
    }
}

pub(super) fn staff(store: &str) -> StaffMember {
    StaffMember {
        id: "cashier-7".to_string(),
        store_id: StoreId(store.to_string()),
    }
}

pub(super) struct Harness {
    pub(super) service: Arc<RewardService<InMemoryRepository, MemoryNotifier>>,
    pub(super) repository: Arc<InMemoryRepository>,
    pub(super) notifier: Arc<MemoryNotifier>,
    pub(super) clock: Arc<ManualClock>,
}

impl Harness {
    /// Checks in until the bakery's three-visit rule issues a reward.
    pub(super) fn earn_reward(&self) -> Reward {
        for _ in 0..2 {
            self.service.record_qr_visit(check_in()).expect("visit");
        }
        let outcome = self.service.record_qr_visit(check_in()).expect("visit");
        assert!(outcome.reward_earned);
        self.service
            .customer_rewards(&phone())
            .expect("rewards")
            .into_iter()
            .next()
            .expect("reward issued")
    }

    /// Republishes the bakery's rule with a different threshold.
    pub(super) fn set_visits_needed(&self, visits_needed: u32) {
        self.repository.put_store(
            store(STORE, "Corner Bakery"),
            Some(bakery_rule(visits_needed)),
        );
    }

    /// Checks in `count` times, returning progress and whether each visit earned a reward.
    pub(super) fn check_in_times(&self, count: usize) -> Vec<(u32, bool)> {
        (0..count)
            .map(|_| {
                let outcome = self.service.record_qr_visit(check_in()).expect("visit");
                (outcome.visits_in_period, outcome.reward_earned)
            })
            .collect()
    }
}

fn bakery_rule(visits_needed: u32) -> RewardRule {
    RewardRule {
        description: "Free croissant".to_string(),
        ..RewardRule::fallback(store_id(), visits_needed)
    }
}

pub(super) fn harness() -> Harness {
    let repository = Arc::new(
        InMemoryRepository::new()
            .with_store(store(STORE, "Corner Bakery"), Some(bakery_rule(3)))
            .with_store(store(OTHER_STORE, "Petal & Stem"), None),
    );
    let notifier = Arc::new(MemoryNotifier::default());
    let clock = Arc::new(ManualClock::new(start()));
    let service = RewardService::new(
        repository.clone(),
        notifier.clone(),
        AccrualPolicy::default(),
    )
    .with_clock(clock.clone());

    Harness {
        service: Arc::new(service),
        repository,
        notifier,
        clock,
    }
}

#[derive(Default)]
pub(super) struct MemoryNotifier {
    events: Mutex<Vec<LoyaltyEvent>>,
}

impl MemoryNotifier {
    pub(super) fn templates(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .expect("notifier mutex poisoned")
            .iter()
            .map(LoyaltyEvent::template)
            .collect()
    }
}

impl Notifier for MemoryNotifier {
    fn publish(&self, event: LoyaltyEvent) -> Result<(), NotifyError> {
        self.events
            .lock()
            .expect("notifier mutex poisoned")
            .push(event);
        Ok(())
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
