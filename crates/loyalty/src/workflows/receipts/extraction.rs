use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::domain::{ExtractionResult, FraudAssessment, ReceiptImage};

/// Failure talking to an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("{service} unavailable: {detail}")]
    Unavailable {
        service: &'static str,
        detail: String,
    },
    #[error("{service} returned an unusable response: {detail}")]
    InvalidResponse {
        service: &'static str,
        detail: String,
    },
}

/// OCR collaborator turning a receipt photo into text and candidate fields.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract(&self, image: &ReceiptImage) -> Result<ExtractionResult, UpstreamError>;
}

/// Fraud collaborator scoring an image given what was extracted from it.
#[async_trait]
pub trait FraudScorer: Send + Sync {
    async fn score(
        &self,
        image: &ReceiptImage,
        extraction: &ExtractionResult,
    ) -> Result<FraudAssessment, UpstreamError>;
}

/// Extractor answering from a table keyed by image reference. Unknown references behave as
/// an outage so retry paths can be exercised.
#[derive(Debug, Default)]
pub struct PresetExtractor {
    results: Mutex<HashMap<String, ExtractionResult>>,
}

impl PresetExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: impl Into<String>, result: ExtractionResult) {
        self.results
            .lock()
            .expect("extractor mutex poisoned")
            .insert(reference.into(), result);
    }
}

#[async_trait]
impl FieldExtractor for PresetExtractor {
    async fn extract(&self, image: &ReceiptImage) -> Result<ExtractionResult, UpstreamError> {
        self.results
            .lock()
            .expect("extractor mutex poisoned")
            .get(&image.reference)
            .cloned()
            .ok_or_else(|| UpstreamError::Unavailable {
                service: "field extractor",
                detail: format!("no extraction for {}", image.reference),
            })
    }
}

/// Scorer answering from a table keyed by image reference, with a fallback score.
#[derive(Debug, Default)]
pub struct PresetFraudScorer {
    scores: Mutex<HashMap<String, FraudAssessment>>,
    fallback: FraudAssessment,
}

impl PresetFraudScorer {
    pub fn new(fallback: FraudAssessment) -> Self {
        Self {
            scores: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    pub fn insert(&self, reference: impl Into<String>, assessment: FraudAssessment) {
        self.scores
            .lock()
            .expect("scorer mutex poisoned")
            .insert(reference.into(), assessment);
    }
}

#[async_trait]
impl FraudScorer for PresetFraudScorer {
    async fn score(
        &self,
        image: &ReceiptImage,
        _extraction: &ExtractionResult,
    ) -> Result<FraudAssessment, UpstreamError> {
        Ok(self
            .scores
            .lock()
            .expect("scorer mutex poisoned")
            .get(&image.reference)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
