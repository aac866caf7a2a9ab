//! Error types for the soupsync engine.

use crate::rest::RestError;
use crate::{SoupName, SyncId};
use thiserror::Error;

/// All possible errors from the soupsync engine.
#[derive(Debug, Error)]
pub enum Error {
    // Store errors
    #[error("soup not found: {0}")]
    SoupNotFound(SoupName),

    #[error("soup already exists: {0}")]
    SoupAlreadyExists(SoupName),

    #[error("invalid soup name: '{0}'")]
    InvalidSoupName(SoupName),

    #[error("invalid index path '{path}': {reason}")]
    InvalidIndexPath { path: String, reason: String },

    #[error("no index on path '{path}' in soup {soup}")]
    IndexNotFound { soup: SoupName, path: String },

    #[error("{count} entries in soup {soup} match external id {path}={value}")]
    MultipleMatchesForExternalId {
        soup: SoupName,
        path: String,
        value: String,
        count: usize,
    },

    #[error("entry {id} not found in soup {soup}")]
    EntryNotFound { soup: SoupName, id: i64 },

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("invalid query spec: {0}")]
    InvalidQuerySpec(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no authenticated user to scope the store")]
    NoCurrentUser,

    #[error("store schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: i32, actual: i32 },

    // Translation errors
    #[error("unknown soup in smart query: {0}")]
    UnknownSoup(SoupName),

    #[error("join predicate on unindexed path {soup}:{path}")]
    UnindexedPathInJoin { soup: SoupName, path: String },

    #[error("malformed smart sql: {0}")]
    MalformedSmartSql(String),

    // Sync errors
    #[error("sync not found: {0}")]
    SyncNotFound(String),

    #[error("sync {0} is already running")]
    AlreadyRunning(SyncId),

    #[error("sync manager is stopped or stopping")]
    ManagerStopped,

    #[error("invalid sync config: {0}")]
    InvalidSyncConfig(String),

    #[error("sync {0} is not a sync down")]
    NotASyncDown(SyncId),

    #[error("invalid sync state: {0}")]
    InvalidSyncState(String),

    // Remote errors
    #[error("remote error: {0}")]
    Remote(#[from] RestError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build an [`Error::InvalidIndexPath`].
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidIndexPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error came from the remote collaborator.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
