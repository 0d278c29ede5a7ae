use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{DuplicateKey, LoyaltyRepository, RepositoryError, RepositoryTx, UniqueIndex};
use crate::workflows::receipts::domain::{
    CustomerPhone, Receipt, ReceiptId, ReceiptStatus, StoreId, StoreReceiptConfig,
};
use crate::workflows::rewards::domain::{
    Customer, Reward, RewardId, RewardRule, RewardStatus, Visit,
};

type CycleKey = (CustomerPhone, StoreId, DateTime<Utc>);

#[derive(Debug, Default, Clone)]
struct Tables {
    stores: BTreeMap<StoreId, StoreReceiptConfig>,
    rules: BTreeMap<StoreId, RewardRule>,
    receipts: HashMap<ReceiptId, Receipt>,
    customers: HashMap<CustomerPhone, Customer>,
    visits: Vec<Visit>,
    visit_by_receipt: HashMap<ReceiptId, usize>,
    rewards: HashMap<RewardId, Reward>,
    reward_by_cycle: HashMap<CycleKey, RewardId>,
    reward_codes: HashSet<String>,
}

/// Process-local repository. Transactions hold the lock for their whole duration. The first
/// write copies the tables and the copy replaces the original only on success, so read-only
/// transactions never copy.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: Mutex<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a store as published by the store management collaborator.
    pub fn with_store(self, config: StoreReceiptConfig, rule: Option<RewardRule>) -> Self {
        self.put_store(config, rule);
        self
    }

    pub fn put_store(&self, config: StoreReceiptConfig, rule: Option<RewardRule>) {
        let mut tables = self.tables.lock().expect("repository mutex poisoned");
        if let Some(rule) = rule {
            tables.rules.insert(config.store_id.clone(), rule);
        }
        tables.stores.insert(config.store_id.clone(), config);
    }
}

impl LoyaltyRepository for InMemoryRepository {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn RepositoryTx) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut committed = self
            .tables
            .lock()
            .map_err(|_| RepositoryError::Unavailable("repository mutex poisoned".to_string()))?;
        let (value, working) = {
            let mut tx = MemoryTx {
                committed: &*committed,
                working: None,
            };
            let value = work(&mut tx)?;
            (value, tx.working)
        };
        if let Some(working) = working {
            *committed = working;
        }
        Ok(value)
    }
}

struct MemoryTx<'a> {
    committed: &'a Tables,
    working: Option<Tables>,
}

impl MemoryTx<'_> {
    fn tables(&self) -> &Tables {
        self.working.as_ref().unwrap_or(self.committed)
    }

    fn tables_mut(&mut self) -> &mut Tables {
        let committed = self.committed;
        self.working.get_or_insert_with(|| committed.clone())
    }
}

impl RepositoryTx for MemoryTx<'_> {
    fn store_config(&self, id: &StoreId) -> Result<Option<StoreReceiptConfig>, RepositoryError> {
        Ok(self.tables().stores.get(id).cloned())
    }

    fn store_configs(&self) -> Result<Vec<StoreReceiptConfig>, RepositoryError> {
        Ok(self.tables().stores.values().cloned().collect())
    }

    fn reward_rule(&self, store: &StoreId) -> Result<Option<RewardRule>, RepositoryError> {
        Ok(self.tables().rules.get(store).cloned())
    }

    fn receipt(&self, id: &ReceiptId) -> Result<Option<Receipt>, RepositoryError> {
        Ok(self.tables().receipts.get(id).cloned())
    }

    fn insert_receipt(&mut self, receipt: Receipt) -> Result<(), RepositoryError> {
        if self.tables().receipts.contains_key(&receipt.id) {
            return Err(RepositoryError::Conflict(UniqueIndex::ReceiptId));
        }
        self.tables_mut().receipts.insert(receipt.id.clone(), receipt);
        Ok(())
    }

    fn update_receipt(&mut self, receipt: Receipt) -> Result<(), RepositoryError> {
        match self.tables_mut().receipts.get_mut(&receipt.id) {
            Some(slot) => {
                *slot = receipt;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    fn receipts_with_status(
        &self,
        status: ReceiptStatus,
        limit: usize,
    ) -> Result<Vec<Receipt>, RepositoryError> {
        let mut matching: Vec<Receipt> = self
            .tables()
            .receipts
            .values()
            .filter(|receipt| receipt.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }

    fn duplicate_receipt(
        &self,
        key: DuplicateKey<'_>,
        exclude: &ReceiptId,
    ) -> Result<Option<ReceiptId>, RepositoryError> {
        let found = self
            .tables()
            .receipts
            .values()
            .filter(|receipt| &receipt.id != exclude && receipt.status != ReceiptStatus::Rejected)
            .filter_map(|receipt| receipt.extraction.as_ref().map(|fields| (receipt, fields)))
            .filter(|(_, fields)| key.matches(fields))
            .map(|(receipt, _)| receipt)
            .min_by_key(|receipt| receipt.created_at)
            .map(|receipt| receipt.id.clone());
        Ok(found)
    }

    fn customer(&self, phone: &CustomerPhone) -> Result<Option<Customer>, RepositoryError> {
        Ok(self.tables().customers.get(phone).cloned())
    }

    fn upsert_customer(&mut self, customer: Customer) -> Result<(), RepositoryError> {
        self.tables_mut()
            .customers
            .insert(customer.phone.clone(), customer);
        Ok(())
    }

    fn visit_for_receipt(&self, receipt: &ReceiptId) -> Result<Option<Visit>, RepositoryError> {
        Ok(self
            .tables()
            .visit_by_receipt
            .get(receipt)
            .and_then(|index| self.tables().visits.get(*index))
            .cloned())
    }

    fn insert_visit(&mut self, visit: Visit) -> Result<(), RepositoryError> {
        if let Some(receipt_id) = &visit.receipt_id {
            if self.tables().visit_by_receipt.contains_key(receipt_id) {
                return Err(RepositoryError::Conflict(UniqueIndex::VisitReceipt));
            }
        }
        let tables = self.tables_mut();
        if let Some(receipt_id) = &visit.receipt_id {
            tables
                .visit_by_receipt
                .insert(receipt_id.clone(), tables.visits.len());
        }
        tables.visits.push(visit);
        Ok(())
    }

    fn update_visit(&mut self, visit: Visit) -> Result<(), RepositoryError> {
        let slot = self
            .tables_mut()
            .visits
            .iter_mut()
            .find(|existing| existing.id == visit.id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = visit;
        Ok(())
    }

    fn visits(
        &self,
        customer: &CustomerPhone,
        store: &StoreId,
    ) -> Result<Vec<Visit>, RepositoryError> {
        let mut visits: Vec<Visit> = self
            .tables()
            .visits
            .iter()
            .filter(|visit| &visit.customer_phone == customer && &visit.store_id == store)
            .cloned()
            .collect();
        visits.sort_by_key(|visit| visit.visited_at);
        Ok(visits)
    }

    fn visit_count(&self, customer: &CustomerPhone) -> Result<usize, RepositoryError> {
        Ok(self
            .tables()
            .visits
            .iter()
            .filter(|visit| &visit.customer_phone == customer)
            .count())
    }

    fn reward(&self, id: &RewardId) -> Result<Option<Reward>, RepositoryError> {
        Ok(self.tables().rewards.get(id).cloned())
    }

    fn reward_for_cycle(
        &self,
        customer: &CustomerPhone,
        store: &StoreId,
        period_start: DateTime<Utc>,
    ) -> Result<Option<Reward>, RepositoryError> {
        let key = (customer.clone(), store.clone(), period_start);
        Ok(self
            .tables()
            .reward_by_cycle
            .get(&key)
            .and_then(|id| self.tables().rewards.get(id))
            .cloned())
    }

    fn rewards_for_customer(
        &self,
        customer: &CustomerPhone,
    ) -> Result<Vec<Reward>, RepositoryError> {
        let mut rewards: Vec<Reward> = self
            .tables()
            .rewards
            .values()
            .filter(|reward| &reward.customer_phone == customer)
            .cloned()
            .collect();
        rewards.sort_by_key(|reward| reward.issued_at);
        Ok(rewards)
    }

    fn open_rewards_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reward>, RepositoryError> {
        Ok(self
            .tables()
            .rewards
            .values()
            .filter(|reward| {
                matches!(
                    reward.status,
                    RewardStatus::Pending | RewardStatus::Claimed | RewardStatus::Redeemed
                ) && reward.expires_at < cutoff
            })
            .cloned()
            .collect())
    }

    fn reward_code_exists(&self, code: &str) -> Result<bool, RepositoryError> {
        Ok(self.tables().reward_codes.contains(code))
    }

    fn insert_reward(&mut self, reward: Reward) -> Result<(), RepositoryError> {
        let key = (
            reward.customer_phone.clone(),
            reward.store_id.clone(),
            reward.period_start,
        );
        if self.tables().reward_by_cycle.contains_key(&key) {
            return Err(RepositoryError::Conflict(UniqueIndex::RewardCycle));
        }
        if self.tables().reward_codes.contains(&reward.code) {
            return Err(RepositoryError::Conflict(UniqueIndex::RewardCode));
        }
        let tables = self.tables_mut();
        tables.reward_by_cycle.insert(key, reward.id.clone());
        tables.reward_codes.insert(reward.code.clone());
        tables.rewards.insert(reward.id.clone(), reward);
        Ok(())
    }

    fn update_reward(&mut self, reward: Reward) -> Result<(), RepositoryError> {
        match self.tables_mut().rewards.get_mut(&reward.id) {
            Some(slot) => {
                *slot = reward;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }
}
