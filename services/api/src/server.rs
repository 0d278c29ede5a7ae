use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use tracing::{debug, info, warn};

use crate::cli::ServeArgs;
use crate::infra::{collaborators, http_client, AppState, WebhookNotifier};
use crate::routes::with_loyalty_routes;
use loyalty::config::{AppConfig, SweepConfig};
use loyalty::error::AppError;
use loyalty::storage::{load_store_seeds, InMemoryRepository};
use loyalty::telemetry;
use loyalty::workflows::receipts::ReceiptService;
use loyalty::workflows::rewards::RewardService;

type Receipts = ReceiptService<InMemoryRepository, WebhookNotifier>;
type Rewards = RewardService<InMemoryRepository, WebhookNotifier>;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let repository = Arc::new(InMemoryRepository::new());
    match &config.collaborators.stores_file {
        Some(path) => {
            let seeds = load_store_seeds(path)?;
            info!(stores = seeds.len(), path = %path.display(), "store catalogue loaded");
            for seed in seeds {
                seed.apply(&repository);
            }
        }
        None => warn!("LOYALTY_STORES_FILE not set; no stores accept uploads"),
    }

    let client = http_client(config.pipeline.upstream_timeout)?;
    let notifier = Arc::new(WebhookNotifier::new(
        client.clone(),
        config.collaborators.notify_url.clone(),
    ));
    let receipts = Arc::new(ReceiptService::new(
        repository.clone(),
        notifier.clone(),
        collaborators(&config.collaborators, &client),
        &config.pipeline,
    ));
    let rewards = Arc::new(RewardService::new(
        repository,
        notifier,
        config.pipeline.accrual,
    ));

    spawn_sweep(config.sweep, receipts.clone(), rewards.clone());

    let app = with_loyalty_routes(receipts, rewards)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "loyalty pipeline ready");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodically closes abandoned uploads and persists reward expiry.
fn spawn_sweep(sweep: SweepConfig, receipts: Arc<Receipts>, rewards: Arc<Rewards>) {
    let Some(period) = sweep.interval() else {
        return;
    };
    let stale_after = sweep.stale_pending_after();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match receipts.expire_stale_pending(stale_after) {
                Ok(closed) => debug!(closed, "stale receipt sweep finished"),
                Err(err) => warn!(%err, "stale receipt sweep failed"),
            }
            match rewards.expire_overdue_rewards() {
                Ok(expired) => debug!(expired, "reward expiry sweep finished"),
                Err(err) => warn!(%err, "reward expiry sweep failed"),
            }
        }
    });
}
