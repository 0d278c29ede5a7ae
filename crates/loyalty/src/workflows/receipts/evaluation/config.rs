use serde::{Deserialize, Serialize};

/// Fraud thresholds feeding the decision policy. Passed explicitly so stores can be tuned independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionPolicy {
    /// Scores at or above this value are rejected outright.
    pub fraud_reject_threshold: u8,
    /// Scores at or above this value (and below the reject threshold) go to a reviewer.
    pub fraud_review_threshold: u8,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            fraud_reject_threshold: 70,
            fraud_review_threshold: 40,
        }
    }
}
