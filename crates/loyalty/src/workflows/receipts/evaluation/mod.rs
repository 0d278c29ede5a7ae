mod config;
mod policy;
mod rules;

pub use config::DecisionPolicy;
pub use policy::{decide, Decision, FlagCause, RejectionCause};
pub use rules::{is_future_dated, normalize_tax_id, resolve_store, validate, StoreResolution};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{ExtractionResult, FraudAssessment, ReceiptId, StoreReceiptConfig};

/// Receipt field a validation rule looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptField {
    Store,
    TaxId,
    BranchName,
    TotalAmount,
    ReceiptDate,
    InvoiceNumber,
    Barcode,
    ImageHash,
}

impl ReceiptField {
    pub const fn label(self) -> &'static str {
        match self {
            ReceiptField::Store => "store",
            ReceiptField::TaxId => "tax_id",
            ReceiptField::BranchName => "branch_name",
            ReceiptField::TotalAmount => "total_amount",
            ReceiptField::ReceiptDate => "receipt_date",
            ReceiptField::InvoiceNumber => "invoice_number",
            ReceiptField::Barcode => "barcode",
            ReceiptField::ImageHash => "image_hash",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureIssue {
    Missing,
    Mismatch,
    Unmatched,
    BelowMinimum,
    Expired,
    FutureDated,
    Duplicate,
}

impl FailureIssue {
    pub const fn label(self) -> &'static str {
        match self {
            FailureIssue::Missing => "missing",
            FailureIssue::Mismatch => "mismatch",
            FailureIssue::Unmatched => "unmatched",
            FailureIssue::BelowMinimum => "below_minimum",
            FailureIssue::Expired => "expired",
            FailureIssue::FutureDated => "future_dated",
            FailureIssue::Duplicate => "duplicate",
        }
    }
}

/// Hard failures are objective and auto-reject; soft ones go to a reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    Hard,
    Soft,
}

/// Itemized rule violation surfaced to customers and reviewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldFailure {
    pub field: ReceiptField,
    pub issue: FailureIssue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    pub message: String,
}

impl FieldFailure {
    pub fn severity(&self) -> FailureSeverity {
        match (self.field, self.issue) {
            (_, FailureIssue::Duplicate)
            | (ReceiptField::TotalAmount, FailureIssue::BelowMinimum)
            | (ReceiptField::ReceiptDate, _) => FailureSeverity::Hard,
            _ => FailureSeverity::Soft,
        }
    }

    pub fn is_hard(&self) -> bool {
        self.severity() == FailureSeverity::Hard
    }

    /// Compact tag stored in the receipt's validation flags, e.g. `tax_id_mismatch`.
    pub fn flag(&self) -> String {
        format!("{}_{}", self.field.label(), self.issue.label())
    }
}

impl fmt::Display for FieldFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Earlier, non-rejected receipts sharing an identifying value with the one under validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateMatches {
    pub invoice_number: Option<ReceiptId>,
    pub barcode: Option<ReceiptId>,
    pub image_hash: Option<ReceiptId>,
}

/// Objective rule check results. `store_resolved` is false when no store could be tied to the receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub passed: bool,
    pub store_resolved: bool,
    pub failures: Vec<FieldFailure>,
}

impl ValidationOutcome {
    pub fn hard_failures(&self) -> impl Iterator<Item = &FieldFailure> {
        self.failures.iter().filter(|failure| failure.is_hard())
    }

    pub fn soft_failures(&self) -> impl Iterator<Item = &FieldFailure> {
        self.failures.iter().filter(|failure| !failure.is_hard())
    }
}

/// Stateless evaluator running the validator and the decision policy.
#[derive(Debug, Clone, Default)]
pub struct EvaluationEngine {
    policy: DecisionPolicy,
}

impl EvaluationEngine {
    pub fn new(policy: DecisionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn evaluate(
        &self,
        extraction: &ExtractionResult,
        fraud: &FraudAssessment,
        store: Option<&StoreReceiptConfig>,
        duplicates: &DuplicateMatches,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let validation = validate(extraction, store, duplicates, now);
        let decision = decide(extraction, fraud, &validation, &self.policy);
        Evaluation {
            validation,
            decision,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub validation: ValidationOutcome,
    pub decision: Decision,
}
