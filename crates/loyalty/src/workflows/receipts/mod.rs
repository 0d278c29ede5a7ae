//! Receipt intake, verification and manual review.
//!
//! An upload is claimed as a pending receipt, sent through the field extractor and fraud
//! scorer, validated against the store's receipt rules and settled by the decision policy.
//! Approved receipts are credited to the visit ledger in the same transaction that records
//! the verdict.

pub mod domain;
pub mod evaluation;
pub mod extraction;
pub mod review;
pub mod router;
pub mod service;

#[cfg(test)]
mod tests;

pub use domain::{
    CustomerPhone, ExtractionResult, FraudAssessment, Receipt, ReceiptId, ReceiptImage,
    ReceiptStatus, ReceiptUpload, ReviewStamp, ReviewerId, StoreId, StoreReceiptConfig,
};
pub use evaluation::{
    Decision, DecisionPolicy, EvaluationEngine, FailureIssue, FieldFailure, ReceiptField,
};
pub use extraction::{
    FieldExtractor, FraudScorer, PresetExtractor, PresetFraudScorer, UpstreamError,
};
pub use review::{ReviewAction, ReviewDetail, ReviewRequest, Reviewer, ReviewerRole};
pub use router::receipt_router;
pub use service::{Collaborators, ReceiptOutcome, ReceiptService, ReceiptServiceError};
