use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::evaluation::FieldFailure;

/// Identifier wrapper for uploaded receipts. Clients may supply their own to make retries idempotent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptId(pub String);

impl ReceiptId {
    pub fn generate() -> Self {
        Self(format!("rcpt-{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub String);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Customer phone number, the natural key for customers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerPhone(pub String);

impl CustomerPhone {
    /// Strips formatting characters so "+1 (555) 010-2000" and "+15550102000" are the same customer.
    pub fn normalized(raw: &str) -> Self {
        let trimmed = raw.trim();
        let mut phone = String::with_capacity(trimmed.len());
        for (index, ch) in trimmed.chars().enumerate() {
            if ch.is_ascii_digit() || (index == 0 && ch == '+') {
                phone.push(ch);
            }
        }
        Self(phone)
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim_start_matches('+').is_empty()
    }
}

impl fmt::Display for CustomerPhone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewerId(pub String);

/// Receipt image as handed over by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptImage {
    pub reference: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Upload request entering the pipeline.
#[derive(Debug, Clone)]
pub struct ReceiptUpload {
    pub receipt_id: Option<ReceiptId>,
    pub customer_phone: CustomerPhone,
    pub customer_name: Option<String>,
    pub store_id: Option<StoreId>,
    pub image: ReceiptImage,
}

/// Best-effort fields returned by the field extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionResult {
    pub raw_text: String,
    pub tax_id: Option<String>,
    pub invoice_number: Option<String>,
    pub branch_text: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub total_amount: Option<f64>,
    pub barcode: Option<String>,
    pub image_hash: Option<String>,
}

/// Fraud scorer output. Scores are clamped to 0..=100 on ingest; fractional scores are
/// truncated so comparisons against whole-number thresholds keep their meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FraudAssessment {
    #[serde(deserialize_with = "lenient_score")]
    pub overall: u8,
    #[serde(deserialize_with = "lenient_optional_score")]
    pub tampering: Option<u8>,
    #[serde(deserialize_with = "lenient_optional_score")]
    pub ai_generated: Option<u8>,
    pub indicators: BTreeSet<String>,
}

fn score_from_number(value: f64) -> u8 {
    value.clamp(0.0, 100.0).floor() as u8
}

fn lenient_score<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let score = Option::<f64>::deserialize(deserializer)?;
    Ok(score.map(score_from_number).unwrap_or_default())
}

fn lenient_optional_score<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let score = Option::<f64>::deserialize(deserializer)?;
    Ok(score.map(score_from_number))
}

impl FraudAssessment {
    pub fn clamped(mut self) -> Self {
        self.overall = self.overall.min(100);
        self.tampering = self.tampering.map(|score| score.min(100));
        self.ai_generated = self.ai_generated.map(|score| score.min(100));
        self
    }
}

/// Per-store receipt rules published by the store management collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreReceiptConfig {
    pub store_id: StoreId,
    pub name: String,
    pub tin: String,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub min_receipt_amount: f64,
    pub receipt_validity_hours: u32,
    #[serde(default = "uploads_enabled_default")]
    pub uploads_enabled: bool,
}

fn uploads_enabled_default() -> bool {
    true
}

/// Lifecycle of a receipt.
///
/// ```text
/// pending ──▶ approved (terminal)
///    │   └──▶ rejected (terminal)
///    └──▶ flagged ──▶ approved | rejected   (review only)
///            └──▶ flagged_manual_requested ──▶ approved | rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Approved,
    Rejected,
    Flagged,
    FlaggedManualRequested,
}

impl ReceiptStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Approved => "approved",
            ReceiptStatus::Rejected => "rejected",
            ReceiptStatus::Flagged => "flagged",
            ReceiptStatus::FlaggedManualRequested => "flagged_manual_requested",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, ReceiptStatus::Approved | ReceiptStatus::Rejected)
    }

    pub const fn awaits_review(self) -> bool {
        matches!(
            self,
            ReceiptStatus::Flagged | ReceiptStatus::FlaggedManualRequested
        )
    }

    pub fn can_transition_to(self, next: ReceiptStatus) -> bool {
        use ReceiptStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Flagged)
                | (Flagged, Approved)
                | (Flagged, Rejected)
                | (Flagged, FlaggedManualRequested)
                | (FlaggedManualRequested, Approved)
                | (FlaggedManualRequested, Rejected)
        )
    }
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("receipt cannot move from {from} to {to}")]
pub struct StatusTransitionError {
    pub from: ReceiptStatus,
    pub to: ReceiptStatus,
}

/// Reviewer metadata stamped on a receipt once a human decides it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStamp {
    pub reviewer_id: ReviewerId,
    pub reviewed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One upload attempt together with everything the pipeline learned about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub id: ReceiptId,
    pub image_reference: String,
    pub customer_phone: CustomerPhone,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    pub store_id: Option<StoreId>,
    pub extraction: Option<ExtractionResult>,
    pub fraud: Option<FraudAssessment>,
    pub validation_flags: BTreeSet<String>,
    pub validation_failures: Vec<FieldFailure>,
    pub status: ReceiptStatus,
    pub reason: String,
    pub review: Option<ReviewStamp>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Receipt {
    pub fn pending(id: ReceiptId, upload: &ReceiptUpload, now: DateTime<Utc>) -> Self {
        Self {
            id,
            image_reference: upload.image.reference.clone(),
            customer_phone: upload.customer_phone.clone(),
            customer_name: upload.customer_name.clone(),
            store_id: upload.store_id.clone(),
            extraction: None,
            fraud: None,
            validation_flags: BTreeSet::new(),
            validation_failures: Vec::new(),
            status: ReceiptStatus::Pending,
            reason: "awaiting verification".to_string(),
            review: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the receipt along the lifecycle, refusing anything the state machine does not allow.
    pub fn transition(
        &mut self,
        next: ReceiptStatus,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StatusTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(StatusTransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.reason = reason.into();
        self.updated_at = now;
        Ok(())
    }

    pub fn extracted_tax_id(&self) -> Option<&str> {
        self.extraction
            .as_ref()
            .and_then(|fields| fields.tax_id.as_deref())
    }
}
