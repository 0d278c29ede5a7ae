use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use super::accrual::AccrualError;
use super::domain::RewardId;
use super::service::{QrCheckIn, RewardService, RewardServiceError, StaffMember};
use crate::notify::Notifier;
use crate::storage::{LoyaltyRepository, RepositoryError};
use crate::workflows::receipts::domain::{CustomerPhone, StoreId};

pub const STAFF_ID_HEADER: &str = "x-staff-id";
pub const STAFF_STORE_HEADER: &str = "x-staff-store";

/// Router exposing QR check-in, eligibility and reward lifecycle endpoints.
pub fn reward_router<R, N>(service: Arc<RewardService<R, N>>) -> Router
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    Router::new()
        .route("/api/v1/visits/qr", post(qr_visit_handler::<R, N>))
        .route(
            "/api/v1/customers/:phone/stores/:store_id/eligibility",
            get(eligibility_handler::<R, N>),
        )
        .route(
            "/api/v1/customers/:phone/rewards",
            get(rewards_handler::<R, N>),
        )
        .route(
            "/api/v1/rewards/:reward_id/redeem",
            post(redeem_handler::<R, N>),
        )
        .route("/api/v1/rewards/:reward_id/use", post(use_handler::<R, N>))
        .with_state(service)
}

#[derive(Debug, Deserialize)]
pub(crate) struct RedeemRequest {
    pub phone: String,
}

pub(crate) async fn qr_visit_handler<R, N>(
    State(service): State<Arc<RewardService<R, N>>>,
    axum::Json(check_in): axum::Json<QrCheckIn>,
) -> Response
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    match service.record_qr_visit(check_in) {
        Ok(outcome) => (StatusCode::CREATED, axum::Json(outcome)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn eligibility_handler<R, N>(
    State(service): State<Arc<RewardService<R, N>>>,
    Path((phone, store_id)): Path<(String, String)>,
) -> Response
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    let customer = CustomerPhone::normalized(&phone);
    match service.eligibility(&customer, &StoreId(store_id)) {
        Ok(eligibility) => (StatusCode::OK, axum::Json(eligibility)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn rewards_handler<R, N>(
    State(service): State<Arc<RewardService<R, N>>>,
    Path(phone): Path<String>,
) -> Response
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    let customer = CustomerPhone::normalized(&phone);
    match service.customer_rewards(&customer) {
        Ok(rewards) => (StatusCode::OK, axum::Json(json!({ "rewards": rewards }))).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn redeem_handler<R, N>(
    State(service): State<Arc<RewardService<R, N>>>,
    Path(reward_id): Path<String>,
    axum::Json(request): axum::Json<RedeemRequest>,
) -> Response
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    let customer = CustomerPhone::normalized(&request.phone);
    match service.redeem(&RewardId(reward_id), &customer) {
        Ok(reward) => (StatusCode::OK, axum::Json(reward)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn use_handler<R, N>(
    State(service): State<Arc<RewardService<R, N>>>,
    headers: HeaderMap,
    Path(reward_id): Path<String>,
) -> Response
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let (Some(id), Some(store)) = (
        header_value(STAFF_ID_HEADER),
        header_value(STAFF_STORE_HEADER),
    ) else {
        let payload = json!({ "error": "missing staff identity" });
        return (StatusCode::UNAUTHORIZED, axum::Json(payload)).into_response();
    };

    let staff = StaffMember {
        id,
        store_id: StoreId(store),
    };
    match service.mark_used(&RewardId(reward_id), &staff) {
        Ok(reward) => (StatusCode::OK, axum::Json(reward)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) fn error_response(err: RewardServiceError) -> Response {
    let status = match &err {
        RewardServiceError::RewardNotFound(_)
        | RewardServiceError::StoreNotFound(_)
        | RewardServiceError::Repository(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
        RewardServiceError::Unauthorized(_) => StatusCode::FORBIDDEN,
        RewardServiceError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RewardServiceError::Transition(_)
        | RewardServiceError::Accrual(AccrualError::DuplicateReward { .. })
        | RewardServiceError::Repository(RepositoryError::Conflict(_)) => StatusCode::CONFLICT,
        RewardServiceError::Repository(RepositoryError::Unavailable(_)) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RewardServiceError::Ledger(_) | RewardServiceError::Accrual(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let payload = json!({ "error": err.to_string() });
    (status, axum::Json(payload)).into_response()
}
