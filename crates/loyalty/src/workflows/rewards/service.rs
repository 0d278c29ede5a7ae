use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::accrual::{
    evaluate_eligibility, issue_reward_if_eligible, AccrualError, AccrualPolicy, Eligibility,
};
use super::domain::{Reward, RewardId, RewardTransitionError, VisitId, VisitMethod};
use super::ledger::{record_visit, CheckIn, LedgerError};
use crate::clock::{Clock, SystemClock};
use crate::notify::{dispatch, LoyaltyEvent, Notifier};
use crate::storage::{LoyaltyRepository, RepositoryError, RepositoryTx};
use crate::workflows::receipts::domain::{CustomerPhone, StoreId};

/// QR check-in scanned at the counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCheckIn {
    pub phone: String,
    pub store_id: StoreId,
    #[serde(default)]
    pub name: Option<String>,
}

/// Staff member acting at one store's counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffMember {
    pub id: String,
    pub store_id: StoreId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitOutcome {
    pub visit_id: VisitId,
    pub visit_count: u32,
    pub visits_in_period: u32,
    pub visits_needed: u32,
    pub reward_earned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_id: Option<RewardId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_code: Option<String>,
}

/// Visit crediting outside the receipt path, and the reward lifecycle after issuance.
pub struct RewardService<R, N> {
    repository: Arc<R>,
    notifier: Arc<N>,
    clock: Arc<dyn Clock>,
    policy: AccrualPolicy,
}

impl<R, N> RewardService<R, N>
where
    R: LoyaltyRepository + 'static,
    N: Notifier + 'static,
{
    pub fn new(repository: Arc<R>, notifier: Arc<N>, policy: AccrualPolicy) -> Self {
        Self {
            repository,
            notifier,
            clock: Arc::new(SystemClock),
            policy,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn record_qr_visit(
        &self,
        check_in: QrCheckIn,
    ) -> Result<VisitOutcome, RewardServiceError> {
        let phone = CustomerPhone::normalized(&check_in.phone);
        if phone.is_empty() {
            return Err(RewardServiceError::InvalidRequest(
                "customer phone is required".to_string(),
            ));
        }

        let now = self.clock.now();
        let (outcome, event) = self.repository.transaction(|tx| {
            require_store(tx, &check_in.store_id)?;
            let entry = record_visit(
                tx,
                CheckIn {
                    customer_phone: phone.clone(),
                    customer_name: check_in.name.clone(),
                    store_id: check_in.store_id.clone(),
                    method: VisitMethod::Qr,
                    receipt_id: None,
                },
                now,
            )?;
            let accrual = issue_reward_if_eligible(
                tx,
                &phone,
                &check_in.store_id,
                Some(&entry.visit.id),
                &self.policy,
                now,
            )?;

            let event = match &accrual.reward {
                Some(reward) => LoyaltyEvent::RewardAvailable {
                    customer_phone: phone.clone(),
                    store_id: check_in.store_id.clone(),
                    reward_id: reward.id.clone(),
                    reward_code: reward.code.clone(),
                },
                None => LoyaltyEvent::RewardMilestone {
                    customer_phone: phone.clone(),
                    store_id: check_in.store_id.clone(),
                    visits_in_period: accrual.visits_in_period,
                    visits_needed: accrual.visits_needed,
                },
            };
            let outcome = VisitOutcome {
                visit_id: entry.visit.id,
                visit_count: entry.customer.total_visits,
                visits_in_period: accrual.visits_in_period,
                visits_needed: accrual.visits_needed,
                reward_earned: accrual.reward.is_some(),
                reward_id: accrual.reward.as_ref().map(|reward| reward.id.clone()),
                reward_code: accrual.reward.map(|reward| reward.code),
            };
            Ok::<_, RewardServiceError>((outcome, event))
        })?;

        info!(customer = %phone, store = %check_in.store_id, visit = %outcome.visit_id, "qr visit recorded");
        dispatch(self.notifier.as_ref(), vec![event]);
        Ok(outcome)
    }

    pub fn eligibility(
        &self,
        customer: &CustomerPhone,
        store: &StoreId,
    ) -> Result<Eligibility, RewardServiceError> {
        let now = self.clock.now();
        self.repository.transaction(|tx| {
            require_store(tx, store)?;
            Ok(evaluate_eligibility(tx, customer, store, &self.policy, now)?)
        })
    }

    /// Every reward the customer holds, with expiry applied as of now.
    pub fn customer_rewards(
        &self,
        customer: &CustomerPhone,
    ) -> Result<Vec<Reward>, RewardServiceError> {
        let now = self.clock.now();
        let rewards = self
            .repository
            .transaction(|tx| tx.rewards_for_customer(customer))?;
        Ok(rewards.iter().map(|reward| reward.as_of(now)).collect())
    }

    /// Customer presents a claimed reward at the counter.
    pub fn redeem(
        &self,
        reward_id: &RewardId,
        customer: &CustomerPhone,
    ) -> Result<Reward, RewardServiceError> {
        let now = self.clock.now();
        let reward = self.repository.transaction(|tx| -> Result<_, RewardServiceError> {
            let mut reward = fetch(tx, reward_id)?;
            if &reward.customer_phone != customer {
                return Err(RewardServiceError::Unauthorized(
                    "reward belongs to another customer".to_string(),
                ));
            }
            reward.redeem(now)?;
            tx.update_reward(reward.clone())?;
            Ok(reward)
        })?;

        info!(reward = %reward.id, customer = %customer, "reward redeemed");
        Ok(reward)
    }

    /// Staff confirm a redeemed reward was honoured at their store.
    pub fn mark_used(
        &self,
        reward_id: &RewardId,
        staff: &StaffMember,
    ) -> Result<Reward, RewardServiceError> {
        let now = self.clock.now();
        let reward = self.repository.transaction(|tx| -> Result<_, RewardServiceError> {
            let mut reward = fetch(tx, reward_id)?;
            if reward.store_id != staff.store_id {
                return Err(RewardServiceError::Unauthorized(format!(
                    "reward was issued by store {}",
                    reward.store_id
                )));
            }
            reward.mark_used(staff.id.clone(), now)?;
            tx.update_reward(reward.clone())?;
            Ok(reward)
        })?;

        info!(reward = %reward.id, staff = %staff.id, "reward used");
        Ok(reward)
    }

    /// Persists expiry for rewards that lapsed without being used. Reads already treat them
    /// as expired; this keeps stored state in line for reporting.
    pub fn expire_overdue_rewards(&self) -> Result<usize, RewardServiceError> {
        let now = self.clock.now();
        let expired = self.repository.transaction(|tx| {
            let mut expired = 0;
            for mut reward in tx.open_rewards_expiring_before(now)? {
                if reward.settle_expiry(now) {
                    tx.update_reward(reward)?;
                    expired += 1;
                }
            }
            Ok::<_, RepositoryError>(expired)
        })?;

        if expired > 0 {
            info!(count = expired, "overdue rewards expired");
        }
        Ok(expired)
    }
}

fn require_store(tx: &dyn RepositoryTx, store: &StoreId) -> Result<(), RewardServiceError> {
    match tx.store_config(store)? {
        Some(_) => Ok(()),
        None => Err(RewardServiceError::StoreNotFound(store.clone())),
    }
}

fn fetch(tx: &dyn RepositoryTx, reward_id: &RewardId) -> Result<Reward, RewardServiceError> {
    tx.reward(reward_id)?
        .ok_or_else(|| RewardServiceError::RewardNotFound(reward_id.clone()))
}

/// Error raised by the reward service.
#[derive(Debug, thiserror::Error)]
pub enum RewardServiceError {
    #[error("reward {0} not found")]
    RewardNotFound(RewardId),
    #[error("store {0} not found")]
    StoreNotFound(StoreId),
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Transition(#[from] RewardTransitionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Accrual(#[from] AccrualError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
