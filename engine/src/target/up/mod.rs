//! Sync up targets.
//!
//! The manager reads the dirty records of a soup through
//! [`SyncUpTarget::dirty_records`] and hands them over in batches of at
//! most [`SyncUpTarget::max_batch_size`]. Each record yields a
//! [`SyncUpOutcome`]; only [`SyncUpOutcome::Applied`] clears its flags.

mod advanced;
mod crud;
mod parent_children;

pub use advanced::{AdvancedSyncUpTarget, AdvancedTarget};
pub use crud::{BatchTarget, RestTarget};
pub use parent_children::ParentChildrenUpTarget;

use super::SyncContext;
use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of pushing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpOutcome {
    /// The remote accepted the change and the local record is clean
    Applied,
    /// The remote copy changed since the last sync; the record stays dirty
    Conflict,
    /// The remote rejected the change; the record stays dirty
    Failed(String),
}

impl SyncUpOutcome {
    pub fn error(&self) -> Option<&str> {
        match self {
            SyncUpOutcome::Failed(message) => Some(message),
            _ => None,
        }
    }
}

/// A sync up target, tagged by `type` in the sync config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncUpTarget {
    /// One REST call per record
    Rest(RestTarget),
    /// Records grouped into composite calls
    Batch(BatchTarget),
    /// Dispatch owned by an application supplied implementation
    Advanced(AdvancedTarget),
    ParentChildren(ParentChildrenUpTarget),
}

impl Default for SyncUpTarget {
    fn default() -> Self {
        SyncUpTarget::Rest(RestTarget::default())
    }
}

impl SyncUpTarget {
    pub fn validate(&self) -> Result<()> {
        match self {
            SyncUpTarget::Rest(t) => t.validate(),
            SyncUpTarget::Batch(t) => t.validate(),
            SyncUpTarget::Advanced(t) => t.validate(),
            SyncUpTarget::ParentChildren(t) => t.validate(),
        }
    }

    /// Records per call to [`SyncUpTarget::sync_up_batch`]. Advanced
    /// targets declare their own size.
    pub fn max_batch_size(&self, advanced: Option<&dyn AdvancedSyncUpTarget>) -> usize {
        match self {
            SyncUpTarget::Rest(_) | SyncUpTarget::ParentChildren(_) => 1,
            SyncUpTarget::Batch(t) => t.max_batch_size,
            SyncUpTarget::Advanced(_) => advanced.map_or(1, |a| a.max_batch_size().max(1)),
        }
    }

    /// Records of the sync soup waiting to be pushed.
    pub fn dirty_records(&self, ctx: &SyncContext<'_>) -> Result<Vec<Value>> {
        match self {
            SyncUpTarget::ParentChildren(t) => t.dirty_records(ctx),
            _ => super::dirty_records(ctx.store, ctx.soup_name),
        }
    }

    /// Push one batch of dirty records.
    ///
    /// Remote failures become per-record outcomes; only local store errors
    /// are returned as `Err`. Advanced targets own the per-record outcome
    /// and report only overall success.
    pub async fn sync_up_batch(
        &self,
        ctx: &SyncContext<'_>,
        records: Vec<Value>,
        advanced: Option<&dyn AdvancedSyncUpTarget>,
    ) -> Result<Vec<SyncUpOutcome>> {
        match self {
            SyncUpTarget::Rest(t) => t.sync_up(ctx, records).await,
            SyncUpTarget::Batch(t) => t.sync_up(ctx, records).await,
            SyncUpTarget::ParentChildren(t) => t.sync_up(ctx, records).await,
            SyncUpTarget::Advanced(t) => {
                let implementation = advanced.ok_or_else(|| {
                    Error::InvalidSyncConfig(format!("no advanced target named '{}'", t.name))
                })?;
                let count = records.len();
                implementation.sync_up_records(ctx, t, records).await?;
                Ok(vec![SyncUpOutcome::Applied; count])
            }
        }
    }
}
