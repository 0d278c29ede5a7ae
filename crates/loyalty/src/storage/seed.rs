//! Store catalogue loaded at startup until the store management collaborator is wired in.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::InMemoryRepository;
use crate::workflows::receipts::domain::StoreReceiptConfig;
use crate::workflows::rewards::domain::{RewardKind, RewardRule};

#[derive(Debug, thiserror::Error)]
pub enum StoreSeedError {
    #[error("unable to read store catalogue {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store catalogue is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("store catalogue lists {0} more than once")]
    DuplicateStore(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Catalogue {
    stores: Vec<StoreSeed>,
}

/// One store and, optionally, the reward rule it publishes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSeed {
    #[serde(flatten)]
    pub config: StoreReceiptConfig,
    #[serde(default)]
    pub reward_rule: Option<RuleSeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSeed {
    pub visits_needed: u32,
    pub reward_kind: RewardKind,
    pub reward_value: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default = "active_default")]
    pub active: bool,
}

fn active_default() -> bool {
    true
}

impl StoreSeed {
    pub fn apply(self, repository: &InMemoryRepository) {
        let rule = self.reward_rule.map(|rule| RewardRule {
            store_id: self.config.store_id.clone(),
            visits_needed: rule.visits_needed,
            reward_kind: rule.reward_kind,
            reward_value: rule.reward_value,
            description: rule.description,
            active: rule.active,
        });
        repository.put_store(self.config, rule);
    }
}

pub fn parse_store_seeds(raw: &str) -> Result<Vec<StoreSeed>, StoreSeedError> {
    let catalogue: Catalogue = serde_json::from_str(raw)?;
    let mut seen = std::collections::BTreeSet::new();
    for seed in &catalogue.stores {
        if !seen.insert(seed.config.store_id.clone()) {
            return Err(StoreSeedError::DuplicateStore(seed.config.store_id.0.clone()));
        }
    }
    Ok(catalogue.stores)
}

pub fn load_store_seeds(path: &Path) -> Result<Vec<StoreSeed>, StoreSeedError> {
    let raw = fs::read_to_string(path).map_err(|source| StoreSeedError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_store_seeds(&raw)
}
