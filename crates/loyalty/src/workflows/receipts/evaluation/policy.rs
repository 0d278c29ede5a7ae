use serde::{Deserialize, Serialize};

use super::super::domain::{ExtractionResult, FraudAssessment, ReceiptStatus};
use super::config::DecisionPolicy;
use super::{FieldFailure, ValidationOutcome};

/// Automated verdict for a receipt, carrying the reason it was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected(RejectionCause),
    Flagged(FlagCause),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum RejectionCause {
    FraudVeto { score: u8 },
    RuleViolation { failures: Vec<FieldFailure> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FlagCause {
    UnresolvedStore,
    FraudReview { score: u8, indicators: Vec<String> },
    IdentityMismatch { failures: Vec<FieldFailure> },
}

impl Decision {
    pub fn status(&self) -> ReceiptStatus {
        match self {
            Decision::Approved => ReceiptStatus::Approved,
            Decision::Rejected(_) => ReceiptStatus::Rejected,
            Decision::Flagged(_) => ReceiptStatus::Flagged,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Decision::Approved => "receipt verified".to_string(),
            Decision::Rejected(RejectionCause::FraudVeto { score }) => {
                format!("high fraud risk (score {score})")
            }
            Decision::Rejected(RejectionCause::RuleViolation { failures }) => join(failures),
            Decision::Flagged(FlagCause::UnresolvedStore) => {
                "needs store assignment: no store matches this receipt".to_string()
            }
            Decision::Flagged(FlagCause::FraudReview { score, indicators }) => {
                if indicators.is_empty() {
                    format!("needs human review: elevated fraud risk (score {score})")
                } else {
                    format!(
                        "needs human review: elevated fraud risk (score {score}): {}",
                        indicators.join(", ")
                    )
                }
            }
            Decision::Flagged(FlagCause::IdentityMismatch { failures }) => {
                format!("needs human review: {}", join(failures))
            }
        }
    }

    /// Failed checks shown to the customer alongside a rejection.
    pub fn rejection_details(&self) -> Option<&[FieldFailure]> {
        match self {
            Decision::Rejected(RejectionCause::RuleViolation { failures }) => Some(failures),
            _ => None,
        }
    }
}

fn join(failures: &[FieldFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Ordered policy, first match wins: fraud veto, hard failures, missing store, fraud review,
/// soft identity failures, approval. Changing the order changes what customers see.
pub fn decide(
    _extraction: &ExtractionResult,
    fraud: &FraudAssessment,
    validation: &ValidationOutcome,
    policy: &DecisionPolicy,
) -> Decision {
    if fraud.overall >= policy.fraud_reject_threshold {
        return Decision::Rejected(RejectionCause::FraudVeto {
            score: fraud.overall,
        });
    }

    let hard: Vec<FieldFailure> = validation.hard_failures().cloned().collect();
    if !hard.is_empty() {
        return Decision::Rejected(RejectionCause::RuleViolation { failures: hard });
    }

    if !validation.store_resolved {
        return Decision::Flagged(FlagCause::UnresolvedStore);
    }

    if fraud.overall >= policy.fraud_review_threshold {
        return Decision::Flagged(FlagCause::FraudReview {
            score: fraud.overall,
            indicators: fraud.indicators.iter().cloned().collect(),
        });
    }

    let soft: Vec<FieldFailure> = validation.soft_failures().cloned().collect();
    if !soft.is_empty() {
        return Decision::Flagged(FlagCause::IdentityMismatch { failures: soft });
    }

    Decision::Approved
}
