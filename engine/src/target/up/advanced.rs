use crate::target::SyncContext;
use crate::{error::Result, Error};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Config of an advanced target: the name of a registered
/// [`AdvancedSyncUpTarget`] plus free-form parameters handed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedTarget {
    pub name: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl AdvancedTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub(super) fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidSyncConfig(
                "advanced target needs a name".into(),
            ));
        }
        Ok(())
    }
}

/// Application supplied sync up logic, registered with the sync manager by
/// name.
///
/// An implementation receives whole batches of dirty records and owns the
/// remote dispatch as well as the local bookkeeping: it must clear the
/// flags of records it pushed (see [`crate::target::mark_clean`]) and leave
/// the others dirty. Returning `Err` fails the sync.
#[async_trait]
pub trait AdvancedSyncUpTarget: Send + Sync {
    /// Records per call to [`AdvancedSyncUpTarget::sync_up_records`].
    fn max_batch_size(&self) -> usize {
        1
    }

    async fn sync_up_records(
        &self,
        ctx: &SyncContext<'_>,
        config: &AdvancedTarget,
        records: Vec<Value>,
    ) -> Result<()>;
}
