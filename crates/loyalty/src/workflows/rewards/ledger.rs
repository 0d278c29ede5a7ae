use chrono::{DateTime, Utc};
use tracing::debug;

use super::domain::{Customer, Visit, VisitId, VisitMethod};
use crate::storage::{RepositoryError, RepositoryTx, UniqueIndex};
use crate::workflows::receipts::domain::{CustomerPhone, ReceiptId, StoreId};

/// A qualifying check-in about to be credited.
#[derive(Debug, Clone)]
pub struct CheckIn {
    pub customer_phone: CustomerPhone,
    pub customer_name: Option<String>,
    pub store_id: StoreId,
    pub method: VisitMethod,
    pub receipt_id: Option<ReceiptId>,
}

/// Result of crediting a visit: the visit and the customer's updated counters.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub visit: Visit,
    pub customer: Customer,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("a visit already exists for receipt {0}")]
    DuplicateVisit(ReceiptId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Credits one visit and bumps the customer's counters. Must run inside a repository
/// transaction so a failure in either write leaves neither behind.
pub fn record_visit(
    tx: &mut dyn RepositoryTx,
    check_in: CheckIn,
    now: DateTime<Utc>,
) -> Result<LedgerEntry, LedgerError> {
    if let Some(receipt_id) = &check_in.receipt_id {
        if tx.visit_for_receipt(receipt_id)?.is_some() {
            return Err(LedgerError::DuplicateVisit(receipt_id.clone()));
        }
    }

    let mut customer = match tx.customer(&check_in.customer_phone)? {
        Some(customer) => customer,
        None => Customer::new(
            check_in.customer_phone.clone(),
            check_in.customer_name.clone(),
            now,
        ),
    };

    let visit = Visit {
        id: VisitId::generate(),
        customer_phone: check_in.customer_phone,
        store_id: check_in.store_id,
        method: check_in.method,
        receipt_id: check_in.receipt_id,
        visited_at: now,
        reward_earned: false,
    };

    tx.insert_visit(visit.clone()).map_err(|err| match err {
        RepositoryError::Conflict(UniqueIndex::VisitReceipt) => match &visit.receipt_id {
            Some(receipt_id) => LedgerError::DuplicateVisit(receipt_id.clone()),
            None => LedgerError::Repository(err),
        },
        other => LedgerError::Repository(other),
    })?;

    customer.total_visits += 1;
    customer.last_visit = Some(now);
    if customer.name.is_none() {
        customer.name = check_in.customer_name;
    }
    tx.upsert_customer(customer.clone())?;

    debug!(
        customer = %customer.phone,
        store = %visit.store_id,
        visit = %visit.id,
        total_visits = customer.total_visits,
        "visit recorded"
    );

    Ok(LedgerEntry { visit, customer })
}
