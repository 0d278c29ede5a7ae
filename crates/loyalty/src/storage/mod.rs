//! Persistence seam for receipts, customers, visits and rewards.
//!
//! Every pipeline step runs inside [`LoyaltyRepository::transaction`]: the closure either
//! returns `Ok` and all of its writes land together, or returns `Err` and none do. Backends
//! enforce the unique indexes listed on [`UniqueIndex`] so idempotency holds under
//! concurrent writers, not only through application checks.

mod memory;
mod seed;

pub use memory::InMemoryRepository;
pub use seed::{load_store_seeds, parse_store_seeds, RuleSeed, StoreSeed, StoreSeedError};

use chrono::{DateTime, Utc};

use crate::workflows::receipts::domain::{
    CustomerPhone, ExtractionResult, Receipt, ReceiptId, ReceiptStatus, StoreId,
    StoreReceiptConfig,
};
use crate::workflows::rewards::domain::{Customer, Reward, RewardId, RewardRule, Visit};

/// Storage-level uniqueness constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueIndex {
    ReceiptId,
    VisitReceipt,
    RewardCycle,
    RewardCode,
}

impl UniqueIndex {
    pub const fn label(self) -> &'static str {
        match self {
            UniqueIndex::ReceiptId => "receipts.id",
            UniqueIndex::VisitReceipt => "visits.receipt_id",
            UniqueIndex::RewardCycle => "rewards.customer_store_period",
            UniqueIndex::RewardCode => "rewards.code",
        }
    }
}

/// Error enumeration for repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("unique constraint {} violated", .0.label())]
    Conflict(UniqueIndex),
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Identifying receipt value checked for resubmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKey<'a> {
    InvoiceNumber(&'a str),
    Barcode(&'a str),
    ImageHash(&'a str),
}

impl DuplicateKey<'_> {
    /// Comparison form of an identifying value: trimmed and upper-cased, `None` when blank.
    pub fn canonical(raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_uppercase())
    }

    /// Whether `fields` carries the same value, compared in canonical form on both sides.
    pub fn matches(&self, fields: &ExtractionResult) -> bool {
        let (stored, wanted) = match *self {
            DuplicateKey::InvoiceNumber(value) => (fields.invoice_number.as_deref(), value),
            DuplicateKey::Barcode(value) => (fields.barcode.as_deref(), value),
            DuplicateKey::ImageHash(value) => (fields.image_hash.as_deref(), value),
        };
        match (stored.and_then(Self::canonical), Self::canonical(wanted)) {
            (Some(stored), Some(wanted)) => stored == wanted,
            _ => false,
        }
    }
}

/// Storage abstraction so workflows can be exercised in isolation.
pub trait LoyaltyRepository: Send + Sync {
    /// Runs `work` as one serializable unit, committing only when it returns `Ok`.
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn RepositoryTx) -> Result<T, E>,
        E: From<RepositoryError>;
}

/// Operations available inside a transaction.
pub trait RepositoryTx {
    fn store_config(&self, id: &StoreId) -> Result<Option<StoreReceiptConfig>, RepositoryError>;
    fn store_configs(&self) -> Result<Vec<StoreReceiptConfig>, RepositoryError>;
    fn reward_rule(&self, store: &StoreId) -> Result<Option<RewardRule>, RepositoryError>;

    fn receipt(&self, id: &ReceiptId) -> Result<Option<Receipt>, RepositoryError>;
    fn insert_receipt(&mut self, receipt: Receipt) -> Result<(), RepositoryError>;
    fn update_receipt(&mut self, receipt: Receipt) -> Result<(), RepositoryError>;
    /// Receipts in `status`, oldest first.
    fn receipts_with_status(
        &self,
        status: ReceiptStatus,
        limit: usize,
    ) -> Result<Vec<Receipt>, RepositoryError>;
    /// Another non-rejected receipt carrying the same identifying value.
    fn duplicate_receipt(
        &self,
        key: DuplicateKey<'_>,
        exclude: &ReceiptId,
    ) -> Result<Option<ReceiptId>, RepositoryError>;

    fn customer(&self, phone: &CustomerPhone) -> Result<Option<Customer>, RepositoryError>;
    fn upsert_customer(&mut self, customer: Customer) -> Result<(), RepositoryError>;

    fn visit_for_receipt(&self, receipt: &ReceiptId) -> Result<Option<Visit>, RepositoryError>;
    fn insert_visit(&mut self, visit: Visit) -> Result<(), RepositoryError>;
    fn update_visit(&mut self, visit: Visit) -> Result<(), RepositoryError>;
    /// Visits by a customer to a store, oldest first.
    fn visits(
        &self,
        customer: &CustomerPhone,
        store: &StoreId,
    ) -> Result<Vec<Visit>, RepositoryError>;
    fn visit_count(&self, customer: &CustomerPhone) -> Result<usize, RepositoryError>;

    fn reward(&self, id: &RewardId) -> Result<Option<Reward>, RepositoryError>;
    fn reward_for_cycle(
        &self,
        customer: &CustomerPhone,
        store: &StoreId,
        period_start: DateTime<Utc>,
    ) -> Result<Option<Reward>, RepositoryError>;
    fn rewards_for_customer(&self, customer: &CustomerPhone)
        -> Result<Vec<Reward>, RepositoryError>;
    /// Rewards still claimable or redeemable whose expiry is before `cutoff`.
    fn open_rewards_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reward>, RepositoryError>;
    fn reward_code_exists(&self, code: &str) -> Result<bool, RepositoryError>;
    fn insert_reward(&mut self, reward: Reward) -> Result<(), RepositoryError>;
    fn update_reward(&mut self, reward: Reward) -> Result<(), RepositoryError>;
}
