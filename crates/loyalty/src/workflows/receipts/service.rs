use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::domain::{
    CustomerPhone, ExtractionResult, FraudAssessment, Receipt, ReceiptId, ReceiptStatus,
    ReceiptUpload, ReviewStamp, StatusTransitionError, StoreId,
};
use super::evaluation::{
    resolve_store, DuplicateMatches, EvaluationEngine, FieldFailure, StoreResolution,
};
use super::extraction::{FieldExtractor, FraudScorer, UpstreamError};
use super::review::{ReviewAction, ReviewDetail, ReviewRequest, Reviewer};
use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::notify::{dispatch, LoyaltyEvent, Notifier};
use crate::storage::{DuplicateKey, LoyaltyRepository, RepositoryError, RepositoryTx};
use crate::workflows::rewards::accrual::{
    issue_reward_if_eligible, Accrual, AccrualError, AccrualPolicy,
};
use crate::workflows::rewards::domain::{RewardId, VisitId, VisitMethod};
use crate::workflows::rewards::ledger::{record_visit, CheckIn, LedgerEntry, LedgerError};

pub const EXTRACTOR_UNAVAILABLE_FLAG: &str = "extractor_unavailable";
pub const FRAUD_SCORER_UNAVAILABLE_FLAG: &str = "fraud_scorer_unavailable";
pub const STORE_MATCHED_BY_TAX_ID_FLAG: &str = "store_matched_by_tax_id";

const ABANDONED_REASON: &str = "processing abandoned";

/// External collaborators the pipeline calls between its two transactions.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn FieldExtractor>,
    pub scorer: Arc<dyn FraudScorer>,
}

/// Customer-facing result of an upload, status lookup or review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptOutcome {
    pub status: ReceiptStatus,
    pub receipt_id: ReceiptId,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_details: Option<Vec<FieldFailure>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visit_id: Option<VisitId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visit_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visits_in_period: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visits_needed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_earned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_id: Option<RewardId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_code: Option<String>,
}

impl ReceiptOutcome {
    fn from_receipt(receipt: &Receipt) -> Self {
        let rejection_details = (receipt.status == ReceiptStatus::Rejected)
            .then(|| {
                receipt
                    .validation_failures
                    .iter()
                    .filter(|failure| failure.is_hard())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|failures| !failures.is_empty());

        Self {
            status: receipt.status,
            receipt_id: receipt.id.clone(),
            reason: receipt.reason.clone(),
            rejection_details,
            visit_id: None,
            visit_count: None,
            visits_in_period: None,
            visits_needed: None,
            reward_earned: None,
            reward_id: None,
            reward_code: None,
        }
    }

    fn with_credit(mut self, credit: &Credit) -> Self {
        self.visit_id = Some(credit.entry.visit.id.clone());
        self.visit_count = Some(credit.entry.customer.total_visits);
        self.visits_in_period = Some(credit.accrual.visits_in_period);
        self.visits_needed = Some(credit.accrual.visits_needed);
        self.reward_earned = Some(credit.accrual.reward.is_some());
        self.reward_id = credit.accrual.reward.as_ref().map(|reward| reward.id.clone());
        self.reward_code = credit
            .accrual
            .reward
            .as_ref()
            .map(|reward| reward.code.clone());
        self
    }
}

/// A visit credited for an approved receipt and what it did to accrual.
struct Credit {
    entry: LedgerEntry,
    accrual: Accrual,
}

impl Credit {
    fn events(&self) -> Vec<LoyaltyEvent> {
        let visit = &self.entry.visit;
        match &self.accrual.reward {
            Some(reward) => vec![LoyaltyEvent::RewardAvailable {
                customer_phone: visit.customer_phone.clone(),
                store_id: visit.store_id.clone(),
                reward_id: reward.id.clone(),
                reward_code: reward.code.clone(),
            }],
            None => vec![LoyaltyEvent::RewardMilestone {
                customer_phone: visit.customer_phone.clone(),
                store_id: visit.store_id.clone(),
                visits_in_period: self.accrual.visits_in_period,
                visits_needed: self.accrual.visits_needed,
            }],
        }
    }
}

/// Service running uploads through extraction, scoring, validation and the decision policy,
/// and crediting approved receipts to the visit ledger.
pub struct ReceiptService<R, N> {
    repository: Arc<R>,
    notifier: Arc<N>,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    engine: EvaluationEngine,
    accrual: AccrualPolicy,
    upstream_timeout: Duration,
}

impl<R, N> ReceiptService<R, N>
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    pub fn new(
        repository: Arc<R>,
        notifier: Arc<N>,
        collaborators: Collaborators,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            repository,
            notifier,
            collaborators,
            clock: Arc::new(SystemClock),
            engine: EvaluationEngine::new(config.decision),
            accrual: config.accrual,
            upstream_timeout: config.upstream_timeout,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run one upload end to end. Re-submitting a receipt id that is still pending re-runs
    /// verification; any other known id is refused so a visit is never credited twice.
    pub async fn submit(
        &self,
        upload: ReceiptUpload,
    ) -> Result<ReceiptOutcome, ReceiptServiceError> {
        if upload.customer_phone.is_empty() {
            return Err(ReceiptServiceError::InvalidRequest(
                "customer phone is required".to_string(),
            ));
        }

        let claimed_at = self.clock.now();
        let receipt = self
            .repository
            .transaction(|tx| claim_receipt(tx, &upload, claimed_at))?;
        let receipt_id = receipt.id.clone();
        info!(receipt = %receipt_id, customer = %receipt.customer_phone, "receipt accepted for verification");

        let extraction = match self
            .call("field extractor", self.collaborators.extractor.extract(&upload.image))
            .await
        {
            Ok(extraction) => extraction,
            Err(err) => return Err(self.leave_pending(&receipt_id, EXTRACTOR_UNAVAILABLE_FLAG, err)),
        };

        let fraud = match self
            .call(
                "fraud scorer",
                self.collaborators.scorer.score(&upload.image, &extraction),
            )
            .await
        {
            Ok(fraud) => fraud.clamped(),
            Err(err) => {
                return Err(self.leave_pending(&receipt_id, FRAUD_SCORER_UNAVAILABLE_FLAG, err))
            }
        };

        let now = self.clock.now();
        let (outcome, events) = self
            .repository
            .transaction(|tx| self.finalize(tx, &receipt_id, extraction, fraud, now))?;

        info!(
            receipt = %outcome.receipt_id,
            status = %outcome.status,
            reason = %outcome.reason,
            "receipt verified"
        );
        dispatch(self.notifier.as_ref(), events);
        Ok(outcome)
    }

    /// Current state of a receipt, including the visit and reward it produced.
    pub fn status(&self, receipt_id: &ReceiptId) -> Result<ReceiptOutcome, ReceiptServiceError> {
        self.repository.transaction(|tx| {
            let receipt = fetch(tx, receipt_id)?;
            let mut outcome = ReceiptOutcome::from_receipt(&receipt);
            if let Some(visit) = tx.visit_for_receipt(receipt_id)? {
                let customer = tx.customer(&visit.customer_phone)?;
                let reward = tx
                    .rewards_for_customer(&visit.customer_phone)?
                    .into_iter()
                    .find(|reward| reward.visit_id.as_ref() == Some(&visit.id));
                outcome.visit_count = customer.map(|customer| customer.total_visits);
                outcome.reward_earned = Some(visit.reward_earned);
                outcome.reward_id = reward.as_ref().map(|reward| reward.id.clone());
                outcome.reward_code = reward.map(|reward| reward.code);
                outcome.visit_id = Some(visit.id);
            }
            Ok(outcome)
        })
    }

    pub fn get(&self, receipt_id: &ReceiptId) -> Result<Receipt, ReceiptServiceError> {
        self.repository.transaction(|tx| fetch(tx, receipt_id))
    }

    /// Customer escalation of a flagged receipt. Asking twice is harmless.
    pub fn request_manual_review(
        &self,
        receipt_id: &ReceiptId,
        customer: &CustomerPhone,
    ) -> Result<ReceiptOutcome, ReceiptServiceError> {
        let now = self.clock.now();
        self.repository.transaction(|tx| {
            let mut receipt = fetch(tx, receipt_id)?;
            if &receipt.customer_phone != customer {
                return Err(ReceiptServiceError::Unauthorized(
                    "receipt belongs to another customer".to_string(),
                ));
            }

            match receipt.status {
                ReceiptStatus::FlaggedManualRequested => {}
                ReceiptStatus::Flagged => {
                    let reason = format!("manual review requested: {}", receipt.reason);
                    receipt.transition(ReceiptStatus::FlaggedManualRequested, reason, now)?;
                    tx.update_receipt(receipt.clone())?;
                    info!(receipt = %receipt.id, "manual review requested");
                }
                ReceiptStatus::Pending => {
                    return Err(ReceiptServiceError::InvalidRequest(
                        "receipt is still being verified".to_string(),
                    ))
                }
                status => return Err(already_processed(&receipt.id, status)),
            }

            Ok(ReceiptOutcome::from_receipt(&receipt))
        })
    }

    /// Human decision on a flagged receipt.
    pub fn review(
        &self,
        receipt_id: &ReceiptId,
        reviewer: &Reviewer,
        request: ReviewRequest,
    ) -> Result<ReceiptOutcome, ReceiptServiceError> {
        let now = self.clock.now();
        let (outcome, events) = self.repository.transaction(|tx| -> Result<_, ReceiptServiceError> {
            let mut receipt = fetch(tx, receipt_id)?;
            if !reviewer.can_access(receipt.store_id.as_ref()) {
                return Err(ReceiptServiceError::Unauthorized(format!(
                    "reviewer {} cannot review receipts outside their store",
                    reviewer.id.0
                )));
            }
            if !receipt.status.awaits_review() {
                return Err(already_processed(&receipt.id, receipt.status));
            }

            let stamp = ReviewStamp {
                reviewer_id: reviewer.id.clone(),
                reviewed_at: now,
                notes: request.notes.clone(),
            };

            match request.action {
                ReviewAction::Reject => {
                    let reason = request.reason().ok_or_else(|| {
                        ReceiptServiceError::InvalidRequest(
                            "a reason is required to reject a receipt".to_string(),
                        )
                    })?;
                    receipt.transition(ReceiptStatus::Rejected, reason, now)?;
                    receipt.review = Some(stamp);
                    tx.update_receipt(receipt.clone())?;

                    let events = vec![LoyaltyEvent::ManualReviewComplete {
                        customer_phone: receipt.customer_phone.clone(),
                        receipt_id: receipt.id.clone(),
                        approved: false,
                    }];
                    Ok((ReceiptOutcome::from_receipt(&receipt), events))
                }
                ReviewAction::Approve => {
                    if let Some(store_id) = &request.store_id {
                        if !reviewer.is_super_admin() {
                            return Err(ReceiptServiceError::Unauthorized(
                                "only super admins can assign a store".to_string(),
                            ));
                        }
                        if tx.store_config(store_id)?.is_none() {
                            return Err(ReceiptServiceError::StoreNotFound(store_id.clone()));
                        }
                        receipt.store_id = Some(store_id.clone());
                    }
                    if receipt.store_id.is_none() {
                        return Err(ReceiptServiceError::InvalidRequest(
                            "assign a store before approving this receipt".to_string(),
                        ));
                    }

                    let reason = request.reason().unwrap_or("approved by reviewer");
                    receipt.transition(ReceiptStatus::Approved, reason, now)?;
                    receipt.review = Some(stamp);
                    tx.update_receipt(receipt.clone())?;

                    let credit = self.credit_visit(tx, &receipt, now)?;
                    let mut events = vec![LoyaltyEvent::ManualReviewComplete {
                        customer_phone: receipt.customer_phone.clone(),
                        receipt_id: receipt.id.clone(),
                        approved: true,
                    }];
                    events.extend(credit.events());
                    Ok((ReceiptOutcome::from_receipt(&receipt).with_credit(&credit), events))
                }
            }
        })?;

        info!(
            receipt = %outcome.receipt_id,
            reviewer = %reviewer.id.0,
            status = %outcome.status,
            "receipt reviewed"
        );
        dispatch(self.notifier.as_ref(), events);
        Ok(outcome)
    }

    /// Receipts awaiting review that this reviewer may act on; escalated ones first.
    pub fn review_queue(
        &self,
        reviewer: &Reviewer,
        limit: usize,
    ) -> Result<Vec<Receipt>, ReceiptServiceError> {
        self.repository.transaction(|tx| {
            let mut queue = Vec::new();
            for status in [ReceiptStatus::FlaggedManualRequested, ReceiptStatus::Flagged] {
                queue.extend(
                    tx.receipts_with_status(status, usize::MAX)?
                        .into_iter()
                        .filter(|receipt| reviewer.can_access(receipt.store_id.as_ref())),
                );
            }
            queue.truncate(limit);
            Ok(queue)
        })
    }

    pub fn review_detail(
        &self,
        receipt_id: &ReceiptId,
        reviewer: &Reviewer,
    ) -> Result<ReviewDetail, ReceiptServiceError> {
        let now = self.clock.now();
        self.repository.transaction(|tx| {
            let receipt = fetch(tx, receipt_id)?;
            if !reviewer.can_access(receipt.store_id.as_ref()) {
                return Err(ReceiptServiceError::Unauthorized(format!(
                    "reviewer {} cannot view receipts outside their store",
                    reviewer.id.0
                )));
            }
            let store = match &receipt.store_id {
                Some(store_id) => tx.store_config(store_id)?,
                None => None,
            };
            Ok(ReviewDetail::assemble(receipt, store, now))
        })
    }

    /// Rejects receipts left pending for longer than `max_age`, typically after an upstream
    /// outage nobody retried. Returns how many were closed.
    pub fn expire_stale_pending(
        &self,
        max_age: chrono::Duration,
    ) -> Result<usize, ReceiptServiceError> {
        let now = self.clock.now();
        let cutoff = now - max_age;
        let abandoned = self.repository.transaction(|tx| {
            let mut abandoned = Vec::new();
            for mut receipt in tx.receipts_with_status(ReceiptStatus::Pending, usize::MAX)? {
                if receipt.created_at >= cutoff {
                    continue;
                }
                receipt.transition(ReceiptStatus::Rejected, ABANDONED_REASON, now)?;
                tx.update_receipt(receipt.clone())?;
                abandoned.push(receipt);
            }
            Ok::<_, ReceiptServiceError>(abandoned)
        })?;

        if !abandoned.is_empty() {
            info!(count = abandoned.len(), "stale pending receipts rejected");
        }
        let count = abandoned.len();
        dispatch(
            self.notifier.as_ref(),
            abandoned
                .into_iter()
                .map(|receipt| LoyaltyEvent::ReceiptRejected {
                    customer_phone: receipt.customer_phone,
                    receipt_id: receipt.id,
                    reason: receipt.reason,
                })
                .collect(),
        );
        Ok(count)
    }

    async fn call<T>(
        &self,
        service: &'static str,
        request: impl Future<Output = Result<T, UpstreamError>>,
    ) -> Result<T, UpstreamError> {
        tokio::time::timeout(self.upstream_timeout, request)
            .await
            .map_err(|_| UpstreamError::Timeout(service))?
    }

    /// Records why verification stalled and keeps the receipt pending for a retry.
    fn leave_pending(
        &self,
        receipt_id: &ReceiptId,
        flag: &str,
        err: UpstreamError,
    ) -> ReceiptServiceError {
        warn!(receipt = %receipt_id, %err, "verification delayed");
        let now = self.clock.now();
        let noted = self.repository.transaction(|tx| -> Result<(), RepositoryError> {
            let Some(mut receipt) = tx.receipt(receipt_id)? else {
                return Ok(());
            };
            if receipt.status != ReceiptStatus::Pending {
                return Ok(());
            }
            receipt.validation_flags.insert(flag.to_string());
            receipt.reason = format!("verification delayed: {err}");
            receipt.updated_at = now;
            tx.update_receipt(receipt)
        });
        if let Err(store_err) = noted {
            warn!(receipt = %receipt_id, %store_err, "could not record upstream failure");
        }

        ReceiptServiceError::UpstreamUnavailable {
            receipt_id: receipt_id.clone(),
            source: err,
        }
    }

    fn finalize(
        &self,
        tx: &mut dyn RepositoryTx,
        receipt_id: &ReceiptId,
        extraction: ExtractionResult,
        fraud: FraudAssessment,
        now: DateTime<Utc>,
    ) -> Result<(ReceiptOutcome, Vec<LoyaltyEvent>), ReceiptServiceError> {
        let mut receipt = fetch(tx, receipt_id)?;
        if receipt.status != ReceiptStatus::Pending {
            return Err(already_processed(&receipt.id, receipt.status));
        }

        let stores = tx.store_configs()?;
        let resolution = resolve_store(
            receipt.store_id.as_ref(),
            extraction.tax_id.as_deref(),
            &stores,
        );
        let duplicates = find_duplicates(tx, &extraction, receipt_id)?;
        let evaluation = self.engine.evaluate(
            &extraction,
            &fraud,
            resolution.config(),
            &duplicates,
            now,
        );

        if let StoreResolution::MatchedByTaxId(config) = &resolution {
            receipt.store_id = Some(config.store_id.clone());
            receipt
                .validation_flags
                .insert(STORE_MATCHED_BY_TAX_ID_FLAG.to_string());
        }
        receipt.validation_flags.extend(
            evaluation
                .validation
                .failures
                .iter()
                .map(FieldFailure::flag),
        );
        receipt.validation_failures = evaluation.validation.failures.clone();
        receipt.extraction = Some(extraction);
        receipt.fraud = Some(fraud);
        receipt.transition(
            evaluation.decision.status(),
            evaluation.decision.summary(),
            now,
        )?;
        tx.update_receipt(receipt.clone())?;

        let outcome = ReceiptOutcome::from_receipt(&receipt);
        match receipt.status {
            ReceiptStatus::Approved => {
                let credit = self.credit_visit(tx, &receipt, now)?;
                let mut events = vec![LoyaltyEvent::ReceiptAccepted {
                    customer_phone: receipt.customer_phone.clone(),
                    receipt_id: receipt.id.clone(),
                    visit_id: credit.entry.visit.id.clone(),
                }];
                events.extend(credit.events());
                Ok((outcome.with_credit(&credit), events))
            }
            ReceiptStatus::Rejected => {
                let events = vec![LoyaltyEvent::ReceiptRejected {
                    customer_phone: receipt.customer_phone.clone(),
                    receipt_id: receipt.id.clone(),
                    reason: receipt.reason.clone(),
                }];
                Ok((outcome, events))
            }
            _ => Ok((outcome, Vec::new())),
        }
    }

    fn credit_visit(
        &self,
        tx: &mut dyn RepositoryTx,
        receipt: &Receipt,
        now: DateTime<Utc>,
    ) -> Result<Credit, ReceiptServiceError> {
        let store_id = receipt.store_id.clone().ok_or_else(|| {
            ReceiptServiceError::InvalidRequest("approved receipt has no store".to_string())
        })?;
        let entry = record_visit(
            tx,
            CheckIn {
                customer_phone: receipt.customer_phone.clone(),
                customer_name: receipt.customer_name.clone(),
                store_id: store_id.clone(),
                method: VisitMethod::Receipt,
                receipt_id: Some(receipt.id.clone()),
            },
            now,
        )?;
        let accrual = issue_reward_if_eligible(
            tx,
            &receipt.customer_phone,
            &store_id,
            Some(&entry.visit.id),
            &self.accrual,
            now,
        )?;
        Ok(Credit { entry, accrual })
    }
}

fn fetch(tx: &dyn RepositoryTx, receipt_id: &ReceiptId) -> Result<Receipt, ReceiptServiceError> {
    tx.receipt(receipt_id)?
        .ok_or_else(|| ReceiptServiceError::ReceiptNotFound(receipt_id.clone()))
}

fn already_processed(receipt_id: &ReceiptId, status: ReceiptStatus) -> ReceiptServiceError {
    ReceiptServiceError::AlreadyProcessed {
        receipt_id: receipt_id.clone(),
        status,
    }
}

/// Creates the pending receipt, or hands back the existing one when a client retries an
/// upload that never finished.
fn claim_receipt(
    tx: &mut dyn RepositoryTx,
    upload: &ReceiptUpload,
    now: DateTime<Utc>,
) -> Result<Receipt, ReceiptServiceError> {
    if let Some(store_id) = &upload.store_id {
        let config = tx
            .store_config(store_id)?
            .ok_or_else(|| ReceiptServiceError::StoreNotFound(store_id.clone()))?;
        if !config.uploads_enabled {
            return Err(ReceiptServiceError::UploadsDisabled(store_id.clone()));
        }
    }

    let receipt_id = upload.receipt_id.clone().unwrap_or_else(ReceiptId::generate);
    match tx.receipt(&receipt_id)? {
        Some(existing) if existing.status == ReceiptStatus::Pending => {
            if existing.customer_phone != upload.customer_phone {
                return Err(ReceiptServiceError::Unauthorized(
                    "receipt belongs to another customer".to_string(),
                ));
            }
            Ok(existing)
        }
        Some(existing) => Err(already_processed(&existing.id, existing.status)),
        None => {
            let receipt = Receipt::pending(receipt_id, upload, now);
            tx.insert_receipt(receipt.clone())?;
            Ok(receipt)
        }
    }
}

fn find_duplicates(
    tx: &dyn RepositoryTx,
    extraction: &ExtractionResult,
    receipt_id: &ReceiptId,
) -> Result<DuplicateMatches, RepositoryError> {
    let lookup = |value: Option<&str>, key: for<'k> fn(&'k str) -> DuplicateKey<'k>| {
        match value.and_then(DuplicateKey::canonical) {
            Some(value) => tx.duplicate_receipt(key(&value), receipt_id),
            None => Ok(None),
        }
    };

    Ok(DuplicateMatches {
        invoice_number: lookup(
            extraction.invoice_number.as_deref(),
            |v| DuplicateKey::InvoiceNumber(v),
        )?,
        barcode: lookup(extraction.barcode.as_deref(), |v| DuplicateKey::Barcode(v))?,
        image_hash: lookup(extraction.image_hash.as_deref(), |v| DuplicateKey::ImageHash(v))?,
    })
}

/// Error raised by the receipt service.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptServiceError {
    #[error("receipt {receipt_id} was already processed ({status})")]
    AlreadyProcessed {
        receipt_id: ReceiptId,
        status: ReceiptStatus,
    },
    #[error("receipt {0} not found")]
    ReceiptNotFound(ReceiptId),
    #[error("store {0} not found")]
    StoreNotFound(StoreId),
    #[error("store {0} is not accepting receipt uploads")]
    UploadsDisabled(StoreId),
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("receipt {receipt_id} is pending, verification will be retried: {source}")]
    UpstreamUnavailable {
        receipt_id: ReceiptId,
        #[source]
        source: UpstreamError,
    },
    #[error(transparent)]
    Transition(#[from] StatusTransitionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Accrual(#[from] AccrualError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
