use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tracing::{info, warn};

use loyalty::config::CollaboratorConfig;
use loyalty::error::AppError;
use loyalty::notify::{LoyaltyEvent, Notifier, NotifyError};
use loyalty::workflows::receipts::{
    Collaborators, ExtractionResult, FieldExtractor, FraudAssessment, FraudScorer,
    PresetExtractor, PresetFraudScorer, ReceiptImage, UpstreamError,
};

const EXTRACTOR: &str = "field extractor";
const FRAUD_SCORER: &str = "fraud scorer";
const IMAGE_REFERENCE_HEADER: &str = "x-image-reference";

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| AppError::Client(err.to_string()))
}

/// Wires the extractor and scorer, falling back to empty presets when no URL is configured.
pub(crate) fn collaborators(
    config: &CollaboratorConfig,
    client: &reqwest::Client,
) -> Collaborators {
    let extractor: Arc<dyn FieldExtractor> = match &config.extractor_url {
        Some(url) => Arc::new(HttpFieldExtractor::new(client.clone(), url.clone())),
        None => {
            warn!("LOYALTY_EXTRACTOR_URL not set; uploads will stay pending");
            Arc::new(PresetExtractor::new())
        }
    };
    let scorer: Arc<dyn FraudScorer> = match &config.fraud_scorer_url {
        Some(url) => Arc::new(HttpFraudScorer::new(client.clone(), url.clone())),
        None => {
            warn!("LOYALTY_FRAUD_SCORER_URL not set; every receipt scores zero");
            Arc::new(PresetFraudScorer::new(FraudAssessment::default()))
        }
    };
    Collaborators { extractor, scorer }
}

fn unavailable(service: &'static str, err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        return UpstreamError::Timeout(service);
    }
    UpstreamError::Unavailable {
        service,
        detail: err.to_string(),
    }
}

fn invalid(service: &'static str, err: reqwest::Error) -> UpstreamError {
    UpstreamError::InvalidResponse {
        service,
        detail: err.to_string(),
    }
}

/// OCR service taking the raw image bytes and answering with extracted fields.
pub(crate) struct HttpFieldExtractor {
    client: reqwest::Client,
    url: String,
}

impl HttpFieldExtractor {
    pub(crate) fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl FieldExtractor for HttpFieldExtractor {
    async fn extract(&self, image: &ReceiptImage) -> Result<ExtractionResult, UpstreamError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, image.content_type.as_str())
            .header(IMAGE_REFERENCE_HEADER, image.reference.as_str())
            .body(image.bytes.clone())
            .send()
            .await
            .map_err(|err| unavailable(EXTRACTOR, err))?
            .error_for_status()
            .map_err(|err| unavailable(EXTRACTOR, err))?;

        response
            .json::<ExtractionResult>()
            .await
            .map_err(|err| invalid(EXTRACTOR, err))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoreRequest<'a> {
    image_reference: &'a str,
    content_type: &'a str,
    extraction: &'a ExtractionResult,
}

/// Fraud service scoring a stored image together with what the extractor read from it.
pub(crate) struct HttpFraudScorer {
    client: reqwest::Client,
    url: String,
}

impl HttpFraudScorer {
    pub(crate) fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl FraudScorer for HttpFraudScorer {
    async fn score(
        &self,
        image: &ReceiptImage,
        extraction: &ExtractionResult,
    ) -> Result<FraudAssessment, UpstreamError> {
        let response = self
            .client
            .post(&self.url)
            .json(&ScoreRequest {
                image_reference: &image.reference,
                content_type: &image.content_type,
                extraction,
            })
            .send()
            .await
            .map_err(|err| unavailable(FRAUD_SCORER, err))?
            .error_for_status()
            .map_err(|err| unavailable(FRAUD_SCORER, err))?;

        response
            .json::<FraudAssessment>()
            .await
            .map_err(|err| invalid(FRAUD_SCORER, err))
    }
}

/// Posts events to a webhook off the request path. Without a URL events are only logged.
#[derive(Clone)]
pub(crate) struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub(crate) fn new(client: reqwest::Client, url: Option<String>) -> Self {
        Self { client, url }
    }
}

impl Notifier for WebhookNotifier {
    fn publish(&self, event: LoyaltyEvent) -> Result<(), NotifyError> {
        let Some(url) = self.url.clone() else {
            info!(
                template = event.template(),
                customer = %event.customer_phone(),
                "notification"
            );
            return Ok(());
        };

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        let client = self.client.clone();
        runtime.spawn(async move {
            let template = event.template();
            let delivered = client
                .post(&url)
                .json(&event)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);
            if let Err(err) = delivered {
                warn!(%err, template, "webhook delivery failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loyalty::workflows::receipts::{CustomerPhone, ReceiptId};

    fn event() -> LoyaltyEvent {
        LoyaltyEvent::ManualReviewComplete {
            customer_phone: CustomerPhone("+15550100".to_string()),
            receipt_id: ReceiptId("r1".to_string()),
            approved: true,
        }
    }

    #[test]
    fn notifier_without_url_only_logs() {
        let notifier = WebhookNotifier::new(reqwest::Client::new(), None);
        assert!(notifier.publish(event()).is_ok());
    }

    #[test]
    fn webhook_outside_runtime_reports_transport_error() {
        let notifier = WebhookNotifier::new(
            reqwest::Client::new(),
            Some("http://127.0.0.1:9/hooks".to_string()),
        );
        assert!(matches!(
            notifier.publish(event()),
            Err(NotifyError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_extractor_is_reported_unavailable() {
        let extractor = HttpFieldExtractor::new(
            http_client(Duration::from_millis(500)).expect("client builds"),
            "http://127.0.0.1:9/extract".to_string(),
        );
        let image = ReceiptImage {
            reference: "receipts/r1".to_string(),
            content_type: "image/jpeg".to_string(),
            bytes: vec![0xFF, 0xD8],
        };

        let err = extractor.extract(&image).await.expect_err("nothing listens");
        assert!(matches!(
            err,
            UpstreamError::Unavailable { .. } | UpstreamError::Timeout(_)
        ));
    }
}
