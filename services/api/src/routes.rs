use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde_json::json;

use crate::infra::AppState;
use loyalty::notify::Notifier;
use loyalty::storage::LoyaltyRepository;
use loyalty::workflows::receipts::{receipt_router, ReceiptService};
use loyalty::workflows::rewards::{reward_router, RewardService};

/// Receipt and reward APIs plus the operational endpoints.
pub(crate) fn with_loyalty_routes<R, N>(
    receipts: Arc<ReceiptService<R, N>>,
    rewards: Arc<RewardService<R, N>>,
) -> Router
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    receipt_router(receipts)
        .merge(reward_router(rewards))
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
