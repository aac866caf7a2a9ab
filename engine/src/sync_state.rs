//! Sync state - the persisted record of one sync job.
//!
//! Sync states are stored as entries of the reserved soup [`SYNCS_SOUP`];
//! the entry id doubles as the sync id. Only the sync manager mutates them.

use crate::query::QuerySpec;
use crate::target::down::SyncDownTarget;
use crate::target::up::SyncUpTarget;
use crate::{error::Result, Error, IndexSpec, SoupName, SoupStore, SyncId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved soup holding sync states.
pub const SYNCS_SOUP: &str = "syncs_soup";

const NAME_PATH: &str = "name";
const TYPE_PATH: &str = "type";

/// Direction of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncType {
    SyncDown,
    SyncUp,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::SyncDown => "syncDown",
            SyncType::SyncUp => "syncUp",
        }
    }
}

/// Lifecycle status of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    New,
    Running,
    Stopped,
    Done,
    Failed,
}

/// Conflict resolution policy applied during a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeMode {
    /// Remote writes (up) and remote records (down) always win
    #[default]
    Overwrite,
    /// Skip records changed on the other side since the last sync
    LeaveIfChanged,
}

/// Per-sync options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    #[serde(default)]
    pub merge_mode: MergeMode,
    /// Fields sent on sync up
    #[serde(default, rename = "fieldlist")]
    pub field_list: Vec<String>,
    /// Remove ghost records after each full sync down
    #[serde(default)]
    pub clean_ghosts: bool,
}

impl SyncOptions {
    pub fn new(merge_mode: MergeMode) -> Self {
        Self {
            merge_mode,
            ..Self::default()
        }
    }

    pub fn with_field_list(mut self, fields: &[&str]) -> Self {
        self.field_list = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_clean_ghosts(mut self, clean_ghosts: bool) -> Self {
        self.clean_ghosts = clean_ghosts;
        self
    }
}

/// Target of a sync, typed by direction.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncTarget {
    Down(SyncDownTarget),
    Up(SyncUpTarget),
}

impl SyncTarget {
    pub fn sync_type(&self) -> SyncType {
        match self {
            SyncTarget::Down(_) => SyncType::SyncDown,
            SyncTarget::Up(_) => SyncType::SyncUp,
        }
    }

    /// Parse a target config for the given direction.
    pub fn from_config(sync_type: SyncType, config: Value) -> Result<Self> {
        let target = match sync_type {
            SyncType::SyncDown => SyncTarget::Down(
                serde_json::from_value(config)
                    .map_err(|e| Error::InvalidSyncConfig(format!("sync down target: {}", e)))?,
            ),
            SyncType::SyncUp => SyncTarget::Up(
                serde_json::from_value(config)
                    .map_err(|e| Error::InvalidSyncConfig(format!("sync up target: {}", e)))?,
            ),
        };
        target.validate()?;
        Ok(target)
    }

    pub fn to_config(&self) -> Result<Value> {
        Ok(match self {
            SyncTarget::Down(target) => serde_json::to_value(target)?,
            SyncTarget::Up(target) => serde_json::to_value(target)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            SyncTarget::Down(target) => target.validate(),
            SyncTarget::Up(target) => target.validate(),
        }
    }
}

/// One sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSyncState", into = "RawSyncState")]
pub struct SyncState {
    /// Entry id in [`SYNCS_SOUP`]; 0 until first saved
    pub id: SyncId,
    pub name: Option<String>,
    pub target: SyncTarget,
    pub options: SyncOptions,
    pub soup_name: SoupName,
    pub status: SyncStatus,
    /// 0 to 100
    pub progress: i32,
    /// Remote record count, -1 when unknown
    pub total_size: i64,
    /// Latest remote modification time applied locally, -1 when none
    pub max_time_stamp: Timestamp,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSyncState {
    #[serde(rename = "_soupEntryId", default, skip_serializing_if = "is_unsaved")]
    id: SyncId,
    #[serde(rename = "type")]
    sync_type: SyncType,
    #[serde(default)]
    name: Option<String>,
    target: Value,
    #[serde(default)]
    options: SyncOptions,
    soup_name: SoupName,
    status: SyncStatus,
    #[serde(default)]
    progress: i32,
    #[serde(default = "unknown")]
    total_size: i64,
    #[serde(default = "unknown")]
    max_time_stamp: Timestamp,
    #[serde(default)]
    start_time: Timestamp,
    #[serde(default)]
    end_time: Timestamp,
    #[serde(default)]
    error: Option<String>,
}

fn is_unsaved(id: &SyncId) -> bool {
    *id <= 0
}

fn unknown() -> i64 {
    -1
}

impl TryFrom<RawSyncState> for SyncState {
    type Error = Error;

    fn try_from(raw: RawSyncState) -> Result<Self> {
        let target = match raw.sync_type {
            SyncType::SyncDown => SyncTarget::Down(
                serde_json::from_value(raw.target)
                    .map_err(|e| Error::InvalidSyncState(format!("sync down target: {}", e)))?,
            ),
            SyncType::SyncUp => SyncTarget::Up(
                serde_json::from_value(raw.target)
                    .map_err(|e| Error::InvalidSyncState(format!("sync up target: {}", e)))?,
            ),
        };
        Ok(SyncState {
            id: raw.id,
            name: raw.name,
            target,
            options: raw.options,
            soup_name: raw.soup_name,
            status: raw.status,
            progress: raw.progress,
            total_size: raw.total_size,
            max_time_stamp: raw.max_time_stamp,
            start_time: raw.start_time,
            end_time: raw.end_time,
            error: raw.error,
        })
    }
}

impl From<SyncState> for RawSyncState {
    fn from(state: SyncState) -> Self {
        let sync_type = state.sync_type();
        let target = match &state.target {
            SyncTarget::Down(target) => serde_json::to_value(target),
            SyncTarget::Up(target) => serde_json::to_value(target),
        }
        .unwrap_or(Value::Null);
        RawSyncState {
            id: state.id,
            sync_type,
            name: state.name,
            target,
            options: state.options,
            soup_name: state.soup_name,
            status: state.status,
            progress: state.progress,
            total_size: state.total_size,
            max_time_stamp: state.max_time_stamp,
            start_time: state.start_time,
            end_time: state.end_time,
            error: state.error,
        }
    }
}

impl SyncState {
    /// Create an unsaved sync in status NEW.
    pub fn new(
        target: SyncTarget,
        options: SyncOptions,
        soup_name: impl Into<SoupName>,
        name: Option<String>,
    ) -> Self {
        Self {
            id: 0,
            name,
            target,
            options,
            soup_name: soup_name.into(),
            status: SyncStatus::New,
            progress: 0,
            total_size: -1,
            max_time_stamp: -1,
            start_time: 0,
            end_time: 0,
            error: None,
        }
    }

    pub fn sync_type(&self) -> SyncType {
        self.target.sync_type()
    }

    pub fn merge_mode(&self) -> MergeMode {
        self.options.merge_mode
    }

    pub fn down_target(&self) -> Option<&SyncDownTarget> {
        match &self.target {
            SyncTarget::Down(target) => Some(target),
            SyncTarget::Up(_) => None,
        }
    }

    pub fn up_target(&self) -> Option<&SyncUpTarget> {
        match &self.target {
            SyncTarget::Up(target) => Some(target),
            SyncTarget::Down(_) => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SyncStatus::Running
    }

    pub fn is_done(&self) -> bool {
        self.status == SyncStatus::Done
    }

    pub fn is_stopped(&self) -> bool {
        self.status == SyncStatus::Stopped
    }

    pub fn has_failed(&self) -> bool {
        self.status == SyncStatus::Failed
    }

    /// Register the reserved syncs soup if it does not exist yet.
    pub fn setup_syncs_soup(store: &SoupStore) -> Result<()> {
        if store.soup_exists(SYNCS_SOUP) {
            return Ok(());
        }
        store.register_soup(
            SYNCS_SOUP,
            &[IndexSpec::string(NAME_PATH), IndexSpec::string(TYPE_PATH)],
            false,
        )
    }

    /// Persist this state, assigning its id on first save.
    pub fn save(&mut self, store: &SoupStore) -> Result<()> {
        let doc = serde_json::to_value(&*self)?;
        let saved = store.upsert_entry(SYNCS_SOUP, doc, None)?;
        if let Some(id) = saved.get(crate::index::SOUP_ENTRY_ID).and_then(Value::as_i64) {
            self.id = id;
        }
        Ok(())
    }

    /// Load a sync by id.
    pub fn load(store: &SoupStore, id: SyncId) -> Result<Option<SyncState>> {
        store
            .retrieve_entries(SYNCS_SOUP, &[id])?
            .into_iter()
            .next()
            .map(|doc| serde_json::from_value(doc).map_err(Error::from))
            .transpose()
    }

    /// Load a sync by name.
    pub fn load_by_name(store: &SoupStore, name: &str) -> Result<Option<SyncState>> {
        let spec = QuerySpec::exact(SYNCS_SOUP, NAME_PATH, name, 1);
        store
            .query(&spec, 0)?
            .entries
            .into_iter()
            .next()
            .map(|doc| serde_json::from_value(doc).map_err(Error::from))
            .transpose()
    }

    /// Every persisted sync, oldest first.
    pub fn load_all(store: &SoupStore) -> Result<Vec<SyncState>> {
        store
            .query_all(&QuerySpec::all(SYNCS_SOUP, 1))?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Error::from))
            .collect()
    }

    pub fn delete(store: &SoupStore, id: SyncId) -> Result<()> {
        store.remove_entries(SYNCS_SOUP, &[id])
    }
}
