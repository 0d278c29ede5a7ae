use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

use crate::clock::{Clock, ManualClock};
use crate::config::PipelineConfig;
use crate::notify::{LoyaltyEvent, Notifier, NotifyError};
use crate::storage::{InMemoryRepository, LoyaltyRepository, RepositoryError, RepositoryTx};
use crate::workflows::receipts::domain::{
    CustomerPhone, ExtractionResult, FraudAssessment, ReceiptId, ReceiptImage, ReceiptUpload,
    StoreId, StoreReceiptConfig,
};
use crate::workflows::receipts::extraction::{
    FieldExtractor, PresetExtractor, PresetFraudScorer, UpstreamError,
};
use crate::workflows::receipts::service::{Collaborators, ReceiptService};
use crate::workflows::rewards::domain::RewardRule;

pub(super) const STORE: &str = "store-harbor";
pub(super) const OTHER_STORE: &str = "store-deli";
pub(super) const STORE_TIN: &str = "100-200-300";
pub(super) const PHONE: &str = "+15550100";

pub(super) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
}

pub(super) fn store_id() -> StoreId {
    StoreId(STORE.to_string())
}

pub(super) fn phone() -> CustomerPhone {
    CustomerPhone(PHONE.to_string())
}

pub(super) fn store_config() -> StoreReceiptConfig {
    StoreReceiptConfig {
        store_id: store_id(),
        name: "Harbor Coffee".to_string(),
        tin: STORE_TIN.to_string(),
        branch_name: Some("Harbor".to_string()),
        min_receipt_amount: 5.0,
        receipt_validity_hours: 48,
        uploads_enabled: true,
    }
}

pub(super) fn other_store_config() -> StoreReceiptConfig {
    StoreReceiptConfig {
        store_id: StoreId(OTHER_STORE.to_string()),
        name: "Corner Deli".to_string(),
        tin: "987-654-321".to_string(),
        branch_name: None,
        min_receipt_amount: 0.0,
        receipt_validity_hours: 24,
        uploads_enabled: true,
    }
}

/// A receipt that passes every rule for the harbor store when read at `at`.
pub(super) fn clean_extraction(tag: &str, at: DateTime<Utc>) -> ExtractionResult {
    ExtractionResult {
        raw_text: format!("HARBOR COFFEE TIN {STORE_TIN} INVOICE {tag}"),
        tax_id: Some(STORE_TIN.to_string()),
        invoice_number: Some(format!("INV-{tag}")),
        branch_text: Some("Harbor Coffee - Harbor Branch".to_string()),
        date: Some(at - Duration::hours(2)),
        total_amount: Some(12.5),
        barcode: Some(format!("BC-{tag}")),
        image_hash: Some(format!("hash-{tag}")),
    }
}

pub(super) fn low_risk() -> FraudAssessment {
    FraudAssessment {
        overall: 5,
        ..FraudAssessment::default()
    }
}

pub(super) fn risk(overall: u8, indicators: &[&str]) -> FraudAssessment {
    FraudAssessment {
        overall,
        tampering: Some(overall),
        ai_generated: None,
        indicators: indicators
            .iter()
            .map(|indicator| indicator.to_string())
            .collect::<BTreeSet<_>>(),
    }
}

pub(super) fn upload(receipt_id: &str, store: Option<&str>) -> ReceiptUpload {
    ReceiptUpload {
        receipt_id: Some(ReceiptId(receipt_id.to_string())),
        customer_phone: phone(),
        customer_name: Some("Dana".to_string()),
        store_id: store.map(|id| StoreId(id.to_string())),
        image: ReceiptImage {
            reference: reference(receipt_id),
            content_type: "image/jpeg".to_string(),
            bytes: vec![0xFF, 0xD8, 0xFF],
        },
    }
}

pub(super) fn reference(receipt_id: &str) -> String {
    format!("receipts/{receipt_id}")
}

pub(super) fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        upstream_timeout: StdDuration::from_millis(200),
        ..PipelineConfig::default()
    }
}

pub(super) struct Harness {
    pub(super) service: Arc<ReceiptService<InMemoryRepository, MemoryNotifier>>,
    pub(super) repository: Arc<InMemoryRepository>,
    pub(super) notifier: Arc<MemoryNotifier>,
    pub(super) extractor: Arc<PresetExtractor>,
    pub(super) scorer: Arc<PresetFraudScorer>,
    pub(super) clock: Arc<ManualClock>,
}

impl Harness {
    /// Makes the collaborators answer for `receipt_id` with the given reading.
    pub(super) fn prime(&self, receipt_id: &str, extraction: ExtractionResult, fraud: FraudAssessment) {
        self.extractor.insert(reference(receipt_id), extraction);
        self.scorer.insert(reference(receipt_id), fraud);
    }

    /// Primes a clean receipt read at the current clock.
    pub(super) fn prime_clean(&self, receipt_id: &str) {
        let now = self.clock.now();
        self.prime(receipt_id, clean_extraction(receipt_id, now), low_risk());
    }
}

pub(super) fn harness() -> Harness {
    harness_with(store_rule(5))
}

pub(super) fn store_rule(visits_needed: u32) -> RewardRule {
    RewardRule {
        description: "Free coffee".to_string(),
        ..RewardRule::fallback(store_id(), visits_needed)
    }
}

pub(super) fn harness_with(rule: RewardRule) -> Harness {
    let repository = Arc::new(
        InMemoryRepository::new()
            .with_store(store_config(), Some(rule))
            .with_store(other_store_config(), None),
    );
    build_harness(repository, Arc::new(PresetExtractor::new()))
}

pub(super) fn build_harness(
    repository: Arc<InMemoryRepository>,
    extractor: Arc<PresetExtractor>,
) -> Harness {
    let notifier = Arc::new(MemoryNotifier::default());
    let scorer = Arc::new(PresetFraudScorer::new(low_risk()));
    let clock = Arc::new(ManualClock::new(start()));
    let service = ReceiptService::new(
        repository.clone(),
        notifier.clone(),
        Collaborators {
            extractor: extractor.clone(),
            scorer: scorer.clone(),
        },
        &pipeline_config(),
    )
    .with_clock(clock.clone());

    Harness {
        service: Arc::new(service),
        repository,
        notifier,
        extractor,
        scorer,
        clock,
    }
}

/// Service wired to arbitrary collaborators, for outage scenarios.
pub(super) fn service_with(
    extractor: Arc<dyn FieldExtractor>,
) -> (
    ReceiptService<InMemoryRepository, MemoryNotifier>,
    Arc<InMemoryRepository>,
) {
    let repository = Arc::new(InMemoryRepository::new().with_store(store_config(), None));
    let service = ReceiptService::new(
        repository.clone(),
        Arc::new(MemoryNotifier::default()),
        Collaborators {
            extractor,
            scorer: Arc::new(PresetFraudScorer::new(low_risk())),
        },
        &pipeline_config(),
    )
    .with_clock(Arc::new(ManualClock::new(start())));
    (service, repository)
}

#[derive(Default)]
pub(super) struct MemoryNotifier {
    events: Mutex<Vec<LoyaltyEvent>>,
}

impl MemoryNotifier {
    pub(super) fn events(&self) -> Vec<LoyaltyEvent> {
        self.events.lock().expect("notifier mutex poisoned").clone()
    }

    pub(super) fn templates(&self) -> Vec<&'static str> {
        self.events().iter().map(LoyaltyEvent::template).collect()
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

pub(super) struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn publish(&self, _event: LoyaltyEvent) -> Result<(), NotifyError> {
        Err(NotifyError::Transport("gateway down".to_string()))
    }
}

pub(super) struct OfflineExtractor;

#[async_trait]
impl FieldExtractor for OfflineExtractor {
    async fn extract(&self, _image: &ReceiptImage) -> Result<ExtractionResult, UpstreamError> {
        Err(UpstreamError::Unavailable {
            service: "field extractor",
            detail: "connection refused".to_string(),
        })
    }
}

pub(super) struct StalledExtractor;

#[async_trait]
impl FieldExtractor for StalledExtractor {
    async fn extract(&self, _image: &ReceiptImage) -> Result<ExtractionResult, UpstreamError> {
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        Ok(ExtractionResult::default())
    }
}

pub(super) struct UnavailableRepository;

impl LoyaltyRepository for UnavailableRepository {
    fn transaction<T, E, F>(&self, _work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn RepositoryTx) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        Err(E::from(RepositoryError::Unavailable(
            "database offline".to_string(),
        )))
    }
}

pub(super) fn visit_count(repository: &InMemoryRepository) -> usize {
    repository
        .transaction(|tx| tx.visit_count(&phone()))
        .expect("visit count")
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
