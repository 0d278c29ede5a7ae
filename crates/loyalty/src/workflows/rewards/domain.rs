use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflows::receipts::domain::{CustomerPhone, ReceiptId, StoreId};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisitId(pub String);

impl VisitId {
    pub fn generate() -> Self {
        Self(format!("visit-{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for VisitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RewardId(pub String);

impl RewardId {
    pub fn generate() -> Self {
        Self(format!("reward-{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for RewardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Loyalty member keyed by phone number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub phone: CustomerPhone,
    pub name: Option<String>,
    pub total_visits: u32,
    pub last_visit: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Customer {
    pub fn new(phone: CustomerPhone, name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            phone,
            name,
            total_visits: 0,
            last_visit: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitMethod {
    Qr,
    Receipt,
}

/// One qualifying check-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    pub id: VisitId,
    pub customer_phone: CustomerPhone,
    pub store_id: StoreId,
    pub method: VisitMethod,
    pub receipt_id: Option<ReceiptId>,
    pub visited_at: DateTime<Utc>,
    pub reward_earned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    PercentageDiscount,
    FixedDiscount,
    FreeItem,
}

/// Store-level accrual rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardRule {
    pub store_id: StoreId,
    pub visits_needed: u32,
    pub reward_kind: RewardKind,
    pub reward_value: f64,
    #[serde(default)]
    pub description: String,
    pub active: bool,
}

impl RewardRule {
    /// Rule applied to stores that never published one.
    pub fn fallback(store_id: StoreId, visits_needed: u32) -> Self {
        Self {
            store_id,
            visits_needed,
            reward_kind: RewardKind::PercentageDiscount,
            reward_value: 10.0,
            description: "10% off your next purchase".to_string(),
            active: true,
        }
    }
}

/// Reward lifecycle.
///
/// ```text
/// claimed ──▶ redeemed ──▶ used (terminal)
///    │            │
///    └────────────┴──▶ expired (terminal, once past expires_at)
/// ```
///
/// `Pending` is part of the model for a staged claim flow; issuance auto-claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    Pending,
    Claimed,
    Redeemed,
    Used,
    Expired,
}

impl RewardStatus {
    pub const fn label(self) -> &'static str {
        match self {
            RewardStatus::Pending => "pending",
            RewardStatus::Claimed => "claimed",
            RewardStatus::Redeemed => "redeemed",
            RewardStatus::Used => "used",
            RewardStatus::Expired => "expired",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, RewardStatus::Used | RewardStatus::Expired)
    }
}

impl fmt::Display for RewardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RewardTransitionError {
    #[error("reward {0} has expired")]
    Expired(RewardId),
    #[error("reward {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: RewardId,
        from: RewardStatus,
        to: RewardStatus,
    },
}

/// Reward issued for one completed eligibility cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    pub id: RewardId,
    pub code: String,
    pub customer_phone: CustomerPhone,
    pub store_id: StoreId,
    pub reward_kind: RewardKind,
    pub reward_value: f64,
    pub description: String,
    /// Start of the cycle that earned the reward; with customer and store it is the issuance key.
    pub period_start: DateTime<Utc>,
    pub visit_id: Option<VisitId>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RewardStatus,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by: Option<String>,
}

impl Reward {
    /// Status as of `now`; expiry is computed on read rather than by a timer.
    pub fn effective_status(&self, now: DateTime<Utc>) -> RewardStatus {
        match self.status {
            RewardStatus::Pending | RewardStatus::Claimed | RewardStatus::Redeemed
                if now > self.expires_at =>
            {
                RewardStatus::Expired
            }
            status => status,
        }
    }

    /// Copy with the lazily computed status folded in, for read paths.
    pub fn as_of(&self, now: DateTime<Utc>) -> Self {
        let mut view = self.clone();
        view.status = self.effective_status(now);
        view
    }

    pub fn redeem(&mut self, now: DateTime<Utc>) -> Result<(), RewardTransitionError> {
        self.advance(RewardStatus::Claimed, RewardStatus::Redeemed, now)?;
        self.redeemed_at = Some(now);
        Ok(())
    }

    pub fn mark_used(
        &mut self,
        staff: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RewardTransitionError> {
        self.advance(RewardStatus::Redeemed, RewardStatus::Used, now)?;
        self.used_at = Some(now);
        self.used_by = Some(staff.into());
        Ok(())
    }

    /// Persists a lazily observed expiry. Returns false when nothing changed.
    pub fn settle_expiry(&mut self, now: DateTime<Utc>) -> bool {
        let effective = self.effective_status(now);
        if effective == self.status {
            return false;
        }
        self.status = effective;
        true
    }

    fn advance(
        &mut self,
        from: RewardStatus,
        to: RewardStatus,
        now: DateTime<Utc>,
    ) -> Result<(), RewardTransitionError> {
        let current = self.effective_status(now);
        if current == RewardStatus::Expired {
            return Err(RewardTransitionError::Expired(self.id.clone()));
        }
        if current != from {
            return Err(RewardTransitionError::InvalidTransition {
                id: self.id.clone(),
                from: current,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn reward(now: DateTime<Utc>) -> Reward {
        Reward {
            id: RewardId("reward-1".to_string()),
            code: "ABCD2345".to_string(),
            customer_phone: CustomerPhone("+15550100".to_string()),
            store_id: StoreId("store-1".to_string()),
            reward_kind: RewardKind::PercentageDiscount,
            reward_value: 10.0,
            description: String::new(),
            period_start: now,
            visit_id: None,
            issued_at: now,
            expires_at: now + Duration::days(30),
            status: RewardStatus::Claimed,
            redeemed_at: None,
            used_at: None,
            used_by: None,
        }
    }

    #[test]
    fn lifecycle_runs_claimed_redeemed_used() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut reward = reward(now);

        reward.redeem(now).expect("claimed rewards redeem");
        assert_eq!(reward.status, RewardStatus::Redeemed);
        reward.mark_used("cashier-7", now).expect("redeemed rewards are used");
        assert_eq!(reward.status, RewardStatus::Used);
        assert_eq!(reward.used_by.as_deref(), Some("cashier-7"));

        match reward.redeem(now) {
            Err(RewardTransitionError::InvalidTransition { from, .. }) => {
                assert_eq!(from, RewardStatus::Used)
            }
            other => panic!("expected invalid transition, got {other:?}"),
        }
    }

    #[test]
    fn expiry_is_evaluated_on_read() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut reward = reward(now);
        let later = now + Duration::days(31);

        assert_eq!(reward.effective_status(now), RewardStatus::Claimed);
        assert_eq!(reward.effective_status(later), RewardStatus::Expired);
        assert_eq!(reward.status, RewardStatus::Claimed, "read does not mutate");
        assert!(matches!(
            reward.redeem(later),
            Err(RewardTransitionError::Expired(_))
        ));
        assert!(reward.settle_expiry(later));
        assert!(!reward.settle_expiry(later));
    }

    #[test]
    fn used_rewards_never_expire() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut reward = reward(now);
        reward.status = RewardStatus::Used;
        assert_eq!(
            reward.effective_status(now + Duration::days(90)),
            RewardStatus::Used
        );
    }
}
