use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    ExtractionResult, FraudAssessment, Receipt, ReviewerId, StoreId, StoreReceiptConfig,
};
use super::evaluation::{is_future_dated, normalize_tax_id, FieldFailure};

/// Who is reviewing and how far their authority reaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ReviewerRole {
    SuperAdmin,
    StoreAdmin { store_id: StoreId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reviewer {
    pub id: ReviewerId,
    pub role: ReviewerRole,
}

impl Reviewer {
    pub fn super_admin(id: impl Into<String>) -> Self {
        Self {
            id: ReviewerId(id.into()),
            role: ReviewerRole::SuperAdmin,
        }
    }

    pub fn store_admin(id: impl Into<String>, store_id: StoreId) -> Self {
        Self {
            id: ReviewerId(id.into()),
            role: ReviewerRole::StoreAdmin { store_id },
        }
    }

    pub fn is_super_admin(&self) -> bool {
        matches!(self.role, ReviewerRole::SuperAdmin)
    }

    /// Store admins only see receipts already tied to their own store.
    pub fn can_access(&self, store: Option<&StoreId>) -> bool {
        match &self.role {
            ReviewerRole::SuperAdmin => true,
            ReviewerRole::StoreAdmin { store_id } => store == Some(store_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
}

/// Body of a review decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub action: ReviewAction,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub store_id: Option<StoreId>,
}

impl ReviewRequest {
    pub fn approve() -> Self {
        Self {
            action: ReviewAction::Approve,
            reason: None,
            notes: None,
            store_id: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            action: ReviewAction::Reject,
            reason: Some(reason.into()),
            notes: None,
            store_id: None,
        }
    }

    /// Trimmed, non-empty reason if one was given.
    pub fn reason(&self) -> Option<&str> {
        self.reason
            .as_deref()
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
    }
}

/// Side-by-side view of what the receipt says against what the store expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreComparison {
    pub store_id: StoreId,
    pub store_name: String,
    pub expected_tin: String,
    pub found_tin: Option<String>,
    pub tin_matches: bool,
    pub expected_branch: Option<String>,
    pub found_branch: Option<String>,
    pub branch_matches: Option<bool>,
    pub min_receipt_amount: f64,
    pub found_amount: Option<f64>,
    pub amount_meets_minimum: Option<bool>,
    pub receipt_validity_hours: u32,
    pub receipt_date: Option<DateTime<Utc>>,
    pub within_validity_window: Option<bool>,
}

impl StoreComparison {
    pub fn build(
        extraction: &ExtractionResult,
        config: &StoreReceiptConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let tin_matches = extraction
            .tax_id
            .as_deref()
            .map(|found| normalize_tax_id(found) == normalize_tax_id(&config.tin))
            .unwrap_or(false);
        let branch_matches = match (
            extraction.branch_text.as_deref(),
            config.branch_name.as_deref(),
        ) {
            (Some(found), Some(expected)) => Some(
                found
                    .to_lowercase()
                    .contains(&expected.trim().to_lowercase()),
            ),
            _ => None,
        };
        let window = Duration::hours(i64::from(config.receipt_validity_hours));

        Self {
            store_id: config.store_id.clone(),
            store_name: config.name.clone(),
            expected_tin: config.tin.clone(),
            found_tin: extraction.tax_id.clone(),
            tin_matches,
            expected_branch: config.branch_name.clone(),
            found_branch: extraction.branch_text.clone(),
            branch_matches,
            min_receipt_amount: config.min_receipt_amount,
            found_amount: extraction.total_amount,
            amount_meets_minimum: extraction
                .total_amount
                .map(|total| total >= config.min_receipt_amount),
            receipt_validity_hours: config.receipt_validity_hours,
            receipt_date: extraction.date,
            within_validity_window: extraction
                .date
                .map(|date| now - date <= window && !is_future_dated(date, now)),
        }
    }
}

/// Everything a reviewer needs to judge a flagged receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDetail {
    pub receipt: Receipt,
    pub failures: Vec<FieldFailure>,
    pub fraud: Option<FraudAssessment>,
    pub store: Option<StoreReceiptConfig>,
    pub comparison: Option<StoreComparison>,
}

impl ReviewDetail {
    pub fn assemble(
        receipt: Receipt,
        store: Option<StoreReceiptConfig>,
        now: DateTime<Utc>,
    ) -> Self {
        let comparison = match (&receipt.extraction, &store) {
            (Some(extraction), Some(config)) => {
                Some(StoreComparison::build(extraction, config, now))
            }
            _ => None,
        };
        Self {
            failures: receipt.validation_failures.clone(),
            fraud: receipt.fraud.clone(),
            receipt,
            store,
            comparison,
        }
    }
}
