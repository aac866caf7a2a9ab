//! Declarative store and sync configuration.
//!
//! Apps ship two JSON resources that are applied at startup:
//!
//! ```json
//! {"soups": [{"soupName": "accounts", "indexes": [{"path": "Id", "type": "string"}]}]}
//! {"syncs": [{"syncName": "accountsDown", "syncType": "syncDown", "soupName": "accounts",
//!             "target": {"type": "soql", "query": "SELECT Id, Name FROM Account"},
//!             "options": {"mergeMode": "OVERWRITE"}}]}
//! ```
//!
//! Applying is idempotent: soups and syncs that already exist are left
//! alone.

use crate::manager::SyncManager;
use crate::sync_state::{SyncOptions, SyncTarget, SyncType};
use crate::{error::Result, Error, IndexSpec, SoupName, SoupStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// One soup to register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoupConfig {
    pub soup_name: SoupName,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    #[serde(default)]
    pub external_storage: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub soups: Vec<SoupConfig>,
}

impl StoreConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Register the configured soups that do not exist yet. Returns the
    /// names registered.
    pub fn apply(&self, store: &SoupStore) -> Result<Vec<SoupName>> {
        let mut registered = Vec::new();
        for soup in &self.soups {
            if store.soup_exists(&soup.soup_name) {
                debug!(soup = %soup.soup_name, "soup already registered");
                continue;
            }
            store.register_soup(&soup.soup_name, &soup.indexes, soup.external_storage)?;
            registered.push(soup.soup_name.clone());
        }
        info!(soups = registered.len(), "applied store config");
        Ok(registered)
    }
}

/// One sync to record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub sync_name: String,
    pub sync_type: SyncType,
    pub soup_name: SoupName,
    pub target: Value,
    #[serde(default)]
    pub options: SyncOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncsConfig {
    #[serde(default)]
    pub syncs: Vec<SyncConfig>,
}

impl SyncsConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Record the configured syncs whose name is not taken yet, in status
    /// NEW. Every target is parsed before anything is recorded.
    pub fn apply(&self, manager: &SyncManager) -> Result<Vec<String>> {
        let mut pending = Vec::with_capacity(self.syncs.len());
        for sync in &self.syncs {
            if sync.sync_name.trim().is_empty() {
                return Err(Error::InvalidSyncConfig("sync config without syncName".into()));
            }
            let target = SyncTarget::from_config(sync.sync_type, sync.target.clone())?;
            pending.push((sync, target));
        }

        let mut recorded = Vec::new();
        for (sync, target) in pending {
            if manager.has_sync_with_name(&sync.sync_name)? {
                debug!(name = %sync.sync_name, "sync already recorded");
                continue;
            }
            manager.record_sync(
                target,
                sync.options.clone(),
                &sync.soup_name,
                Some(&sync.sync_name),
            )?;
            recorded.push(sync.sync_name.clone());
        }
        info!(syncs = recorded.len(), "applied syncs config");
        Ok(recorded)
    }
}
