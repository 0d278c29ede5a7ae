//! Visit ledger, rolling-period accrual and the reward lifecycle.

pub mod accrual;
pub mod domain;
pub mod ledger;
pub mod router;
pub mod service;

#[cfg(test)]
mod tests;

pub use accrual::{AccrualError, AccrualPolicy, Eligibility};
pub use domain::{
    Customer, Reward, RewardId, RewardKind, RewardRule, RewardStatus, Visit, VisitId,
    VisitMethod,
};
pub use ledger::{CheckIn, LedgerError};
pub use router::reward_router;
pub use service::{QrCheckIn, RewardService, RewardServiceError, StaffMember, VisitOutcome};
