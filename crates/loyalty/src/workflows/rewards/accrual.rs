//! Rolling-period reward accrual.
//!
//! A period opens on a customer's first visit to a store and lasts [`AccrualPolicy::period`].
//! Reaching the store's visit threshold inside the period issues one reward and closes the
//! cycle; the next visit opens a fresh period. A period that lapses short of the threshold is
//! discarded and the next visit starts over from zero. The current cycle is derived from the
//! visit history on every call, so nothing has to expire in the background.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::domain::{Reward, RewardId, RewardRule, RewardStatus, Visit, VisitId};
use crate::storage::{RepositoryError, RepositoryTx, UniqueIndex};
use crate::workflows::receipts::domain::{CustomerPhone, StoreId};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 8;
const CODE_ATTEMPTS: usize = 8;

/// Accrual windows and defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrualPolicy {
    pub period_days: u32,
    pub reward_validity_days: u32,
    pub default_visits_needed: u32,
}

impl Default for AccrualPolicy {
    fn default() -> Self {
        Self {
            period_days: 45,
            reward_validity_days: 30,
            default_visits_needed: 5,
        }
    }
}

impl AccrualPolicy {
    pub fn period(&self) -> Duration {
        Duration::days(i64::from(self.period_days))
    }

    pub fn reward_validity(&self) -> Duration {
        Duration::days(i64::from(self.reward_validity_days))
    }
}

/// Where a customer stands toward the next reward at one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eligibility {
    pub visits_in_period: u32,
    pub visits_needed: u32,
    pub can_claim: bool,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub period_expired: bool,
}

/// Progress after an accrual pass, with the reward if one was issued.
#[derive(Debug, Clone, PartialEq)]
pub struct Accrual {
    pub visits_in_period: u32,
    pub visits_needed: u32,
    pub reward: Option<Reward>,
}

#[derive(Debug, thiserror::Error)]
pub enum AccrualError {
    #[error("reward already issued for {customer} at {store} for the period starting {period_start}")]
    DuplicateReward {
        customer: CustomerPhone,
        store: StoreId,
        period_start: DateTime<Utc>,
    },
    #[error("could not generate a unique reward code")]
    CodeSpaceExhausted,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

struct Cycle {
    start: Option<DateTime<Utc>>,
    visits: u32,
    last_visit: Option<VisitId>,
}

fn effective_rule(
    tx: &dyn RepositoryTx,
    store: &StoreId,
    policy: &AccrualPolicy,
) -> Result<RewardRule, RepositoryError> {
    Ok(tx
        .reward_rule(store)?
        .unwrap_or_else(|| RewardRule::fallback(store.clone(), policy.default_visits_needed)))
}

/// Replays the visit history to find the open cycle. A cycle closes at the visit that earned
/// its reward, whatever the store's threshold is today.
///
/// Period starts stay unique per customer and store: a cycle reopened at or before the instant
/// the previous rewarded cycle started is moved one microsecond past it.
fn current_cycle(
    tx: &dyn RepositoryTx,
    customer: &CustomerPhone,
    store: &StoreId,
    visits: &[Visit],
    period: Duration,
) -> Result<Cycle, RepositoryError> {
    let mut cycle = Cycle {
        start: None,
        visits: 0,
        last_visit: None,
    };
    let mut rewarded_start: Option<DateTime<Utc>> = None;

    for visit in visits {
        let within = cycle
            .start
            .map(|start| visit.visited_at <= start + period)
            .unwrap_or(false);
        if !within {
            let opened = match rewarded_start {
                Some(previous) if visit.visited_at <= previous => {
                    previous + Duration::microseconds(1)
                }
                _ => visit.visited_at,
            };
            cycle.start = Some(opened);
            cycle.visits = 0;
        }
        cycle.visits += 1;
        cycle.last_visit = Some(visit.id.clone());

        if earned_reward(tx, customer, store, cycle.start, visit)? {
            rewarded_start = cycle.start;
            cycle.start = None;
            cycle.visits = 0;
            cycle.last_visit = None;
        }
    }

    Ok(cycle)
}

fn earned_reward(
    tx: &dyn RepositoryTx,
    customer: &CustomerPhone,
    store: &StoreId,
    cycle_start: Option<DateTime<Utc>>,
    visit: &Visit,
) -> Result<bool, RepositoryError> {
    if visit.reward_earned {
        return Ok(true);
    }
    let Some(start) = cycle_start else {
        return Ok(false);
    };
    Ok(tx
        .reward_for_cycle(customer, store, start)?
        .is_some_and(|reward| reward.visit_id.as_ref() == Some(&visit.id)))
}

pub fn evaluate_eligibility(
    tx: &dyn RepositoryTx,
    customer: &CustomerPhone,
    store: &StoreId,
    policy: &AccrualPolicy,
    now: DateTime<Utc>,
) -> Result<Eligibility, RepositoryError> {
    let rule = effective_rule(tx, store, policy)?;
    let visits = tx.visits(customer, store)?;
    let cycle = current_cycle(tx, customer, store, &visits, policy.period())?;

    let period_end = cycle.start.map(|start| start + policy.period());
    let period_expired = period_end.map(|end| now > end).unwrap_or(false);
    let can_claim = rule.active && !period_expired && cycle.visits >= rule.visits_needed;

    Ok(Eligibility {
        visits_in_period: cycle.visits,
        visits_needed: rule.visits_needed,
        can_claim,
        period_start: cycle.start,
        period_end,
        period_expired,
    })
}

/// Issues the cycle's reward when the threshold has been reached. Safe to retry: once issued
/// the cycle is closed and a second call finds nothing to claim.
pub fn issue_reward_if_eligible(
    tx: &mut dyn RepositoryTx,
    customer: &CustomerPhone,
    store: &StoreId,
    trigger: Option<&VisitId>,
    policy: &AccrualPolicy,
    now: DateTime<Utc>,
) -> Result<Accrual, AccrualError> {
    let rule = effective_rule(tx, store, policy)?;
    let visits = tx.visits(customer, store)?;
    let cycle = current_cycle(tx, customer, store, &visits, policy.period())?;

    let Some(period_start) = cycle.start else {
        return Ok(Accrual {
            visits_in_period: 0,
            visits_needed: rule.visits_needed,
            reward: None,
        });
    };

    let expired = now > period_start + policy.period();
    if !rule.active || expired || cycle.visits < rule.visits_needed {
        return Ok(Accrual {
            visits_in_period: cycle.visits,
            visits_needed: rule.visits_needed,
            reward: None,
        });
    }

    let code = generate_code(tx)?;
    let visit_id = trigger.cloned().or(cycle.last_visit);
    let reward = Reward {
        id: RewardId::generate(),
        code,
        customer_phone: customer.clone(),
        store_id: store.clone(),
        reward_kind: rule.reward_kind,
        reward_value: rule.reward_value,
        description: rule.description.clone(),
        period_start,
        visit_id: visit_id.clone(),
        issued_at: now,
        expires_at: now + policy.reward_validity(),
        status: RewardStatus::Claimed,
        redeemed_at: None,
        used_at: None,
        used_by: None,
    };

    tx.insert_reward(reward.clone()).map_err(|err| match err {
        RepositoryError::Conflict(UniqueIndex::RewardCycle) => AccrualError::DuplicateReward {
            customer: customer.clone(),
            store: store.clone(),
            period_start,
        },
        other => AccrualError::Repository(other),
    })?;

    if let Some(visit_id) = &visit_id {
        if let Some(mut visit) = visits.into_iter().find(|visit| &visit.id == visit_id) {
            visit.reward_earned = true;
            tx.update_visit(visit)?;
        }
    }

    info!(
        customer = %customer,
        store = %store,
        reward = %reward.id,
        visits = cycle.visits,
        "reward issued"
    );

    Ok(Accrual {
        visits_in_period: cycle.visits,
        visits_needed: rule.visits_needed,
        reward: Some(reward),
    })
}

fn generate_code(tx: &dyn RepositoryTx) -> Result<String, AccrualError> {
    let mut rng = rand::thread_rng();
    for _ in 0..CODE_ATTEMPTS {
        let code: String = (0..CODE_LENGTH)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        if !tx.reward_code_exists(&code)? {
            return Ok(code);
        }
    }
    Err(AccrualError::CodeSpaceExhausted)
}
