//! Sync down targets.
//!
//! A target fetches remote records one page at a time. The manager calls
//! [`SyncDownTarget::start_fetch`] once, then [`SyncDownTarget::continue_fetch`]
//! while the previous page returned a [`Continuation`], saving every page
//! through [`SyncDownTarget::save_records`].

mod metadata;
mod mru;
mod parent_children;
mod refresh;
mod soql;
mod sosl;

pub use metadata::{LayoutTarget, MetadataTarget, PicklistTarget};
pub use mru::MruTarget;
pub use parent_children::{ChildrenInfo, ParentChildrenTarget, ParentInfo, RelationshipType};
pub use refresh::RefreshTarget;
pub use soql::SoqlTarget;
pub use sosl::SoslTarget;

use super::{
    dirty_record_ids, entry_ids_for, mark_clean, non_dirty_record_ids, record_id,
    sync_id_predicate, SyncContext,
};
use crate::rest::{RestClient, RestError, RestRequest};
use crate::sync_state::MergeMode;
use crate::{error::Result, Error, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Where the next page of a fetch starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// Remote cursor of a paged query
    NextRecordsUrl(String),
    /// Ids still to be fetched
    RemainingIds(Vec<String>),
}

/// One page of remote records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchPage {
    pub records: Vec<Value>,
    /// Remote record count of the whole fetch, when known
    pub total_size: Option<i64>,
    pub continuation: Option<Continuation>,
}

impl FetchPage {
    pub fn new(records: Vec<Value>) -> Self {
        let total_size = Some(records.len() as i64);
        Self {
            records,
            total_size,
            continuation: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Parse a query response: `{totalSize, done, records, nextRecordsUrl}`.
    pub fn from_query_response(response: &Value) -> Result<Self> {
        let records = response
            .get("records")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                Error::Remote(RestError::UnexpectedResponse(
                    "query response without records".into(),
                ))
            })?;
        let done = response.get("done").and_then(Value::as_bool).unwrap_or(true);
        let continuation = response
            .get("nextRecordsUrl")
            .and_then(Value::as_str)
            .filter(|url| !done && !url.is_empty())
            .map(|url| Continuation::NextRecordsUrl(url.to_string()));
        Ok(Self {
            total_size: response.get("totalSize").and_then(Value::as_i64),
            records,
            continuation,
        })
    }
}

/// A sync down target, tagged by `type` in the sync config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncDownTarget {
    Soql(SoqlTarget),
    Sosl(SoslTarget),
    Mru(MruTarget),
    Refresh(RefreshTarget),
    ParentChildren(ParentChildrenTarget),
    Metadata(MetadataTarget),
    Layout(LayoutTarget),
    Picklist(PicklistTarget),
}

impl SyncDownTarget {
    /// Reject configs that can never run.
    pub fn validate(&self) -> Result<()> {
        match self {
            SyncDownTarget::Soql(t) => t.validate(),
            SyncDownTarget::Sosl(t) => t.validate(),
            SyncDownTarget::Mru(t) => t.validate(),
            SyncDownTarget::Refresh(t) => t.validate(),
            SyncDownTarget::ParentChildren(t) => t.validate(),
            SyncDownTarget::Metadata(t) => t.validate(),
            SyncDownTarget::Layout(t) => t.validate(),
            SyncDownTarget::Picklist(t) => t.validate(),
        }
    }

    pub fn id_field_name(&self) -> &str {
        match self {
            SyncDownTarget::Soql(t) => &t.id_field_name,
            SyncDownTarget::Sosl(t) => &t.id_field_name,
            SyncDownTarget::Mru(t) => &t.id_field_name,
            SyncDownTarget::Refresh(t) => &t.id_field_name,
            SyncDownTarget::ParentChildren(t) => &t.parent.id_field_name,
            SyncDownTarget::Metadata(_)
            | SyncDownTarget::Layout(_)
            | SyncDownTarget::Picklist(_) => super::DEFAULT_ID_FIELD,
        }
    }

    pub fn modification_date_field_name(&self) -> &str {
        match self {
            SyncDownTarget::Soql(t) => &t.modification_date_field_name,
            SyncDownTarget::Sosl(t) => &t.modification_date_field_name,
            SyncDownTarget::Mru(t) => &t.modification_date_field_name,
            SyncDownTarget::Refresh(t) => &t.modification_date_field_name,
            SyncDownTarget::ParentChildren(t) => &t.parent.modification_date_field_name,
            SyncDownTarget::Metadata(_)
            | SyncDownTarget::Layout(_)
            | SyncDownTarget::Picklist(_) => super::DEFAULT_MODIFICATION_DATE_FIELD,
        }
    }

    /// Whether pages arrive in ascending modification order, so the
    /// manager may advance `maxTimeStamp` after every page.
    pub fn is_sorted_by_modification(&self) -> bool {
        match self {
            SyncDownTarget::Soql(t) => {
                crate::soql::is_sorted_by(&t.query, &t.modification_date_field_name)
            }
            _ => false,
        }
    }

    /// Fetch the first page, restricted to records modified after
    /// `max_time_stamp` when the target supports it.
    pub async fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        max_time_stamp: Timestamp,
    ) -> Result<FetchPage> {
        match self {
            SyncDownTarget::Soql(t) => t.start_fetch(ctx, max_time_stamp).await,
            SyncDownTarget::Sosl(t) => t.start_fetch(ctx, max_time_stamp).await,
            SyncDownTarget::Mru(t) => t.start_fetch(ctx).await,
            SyncDownTarget::Refresh(t) => t.start_fetch(ctx).await,
            SyncDownTarget::ParentChildren(t) => t.start_fetch(ctx, max_time_stamp).await,
            SyncDownTarget::Metadata(t) => t.start_fetch(ctx).await,
            SyncDownTarget::Layout(t) => t.start_fetch(ctx).await,
            SyncDownTarget::Picklist(t) => t.start_fetch(ctx).await,
        }
    }

    /// Fetch the page a previous page pointed to.
    pub async fn continue_fetch(
        &self,
        ctx: &SyncContext<'_>,
        continuation: &Continuation,
    ) -> Result<FetchPage> {
        match (self, continuation) {
            (SyncDownTarget::Refresh(t), Continuation::RemainingIds(ids)) => {
                t.fetch_slice(ctx, ids).await
            }
            (_, Continuation::NextRecordsUrl(url)) => query_more(ctx.rest, url).await,
            (_, Continuation::RemainingIds(_)) => Err(Error::InvalidSyncState(
                "id continuation on a query target".into(),
            )),
        }
    }

    /// Latest remote modification time among `records`, or -1.
    pub fn latest_modification_time_stamp(&self, records: &[Value]) -> Timestamp {
        match self {
            SyncDownTarget::ParentChildren(t) => t.latest_modification_time_stamp(records),
            _ => super::latest_modification_time_stamp(
                records,
                self.modification_date_field_name(),
            ),
        }
    }

    /// Write one fetched page into the local store and return how many
    /// records were saved.
    pub fn save_records(&self, ctx: &SyncContext<'_>, records: Vec<Value>) -> Result<usize> {
        match self {
            SyncDownTarget::ParentChildren(t) => t.save_record_trees(ctx, records),
            _ => save_records_to_soup(ctx, self.id_field_name(), records),
        }
    }

    /// Ids of every record the full remote result set holds, or `None`
    /// when the target cannot enumerate them.
    pub async fn fetch_remote_ids(&self, ctx: &SyncContext<'_>) -> Result<Option<HashSet<String>>> {
        let ids = match self {
            SyncDownTarget::Soql(t) => t.fetch_remote_ids(ctx).await?,
            SyncDownTarget::Sosl(t) => t.fetch_remote_ids(ctx).await?,
            SyncDownTarget::Mru(t) => t.fetch_remote_ids(ctx).await?,
            SyncDownTarget::Refresh(t) => t.fetch_remote_ids(ctx).await?,
            SyncDownTarget::ParentChildren(t) => t.fetch_remote_ids(ctx).await?,
            SyncDownTarget::Metadata(_)
            | SyncDownTarget::Layout(_)
            | SyncDownTarget::Picklist(_) => return Ok(None),
        };
        Ok(Some(ids))
    }

    /// Remove local records that are clean but no longer present remotely.
    ///
    /// Dirty records are never removed. When the soup indexes the sync id
    /// field, only records written by this sync are considered.
    pub async fn clean_ghosts(&self, ctx: &SyncContext<'_>) -> Result<usize> {
        let Some(remote_ids) = self.fetch_remote_ids(ctx).await? else {
            return Ok(0);
        };
        if let SyncDownTarget::ParentChildren(t) = self {
            return t.remove_ghosts(ctx, &remote_ids);
        }
        remove_ghosts(ctx, ctx.soup_name, self.id_field_name(), &remote_ids)
    }
}

/// Follow a `nextRecordsUrl`.
pub(crate) async fn query_more(rest: &dyn RestClient, url: &str) -> Result<FetchPage> {
    let response = rest.execute(RestRequest::query_more(url)).await?;
    FetchPage::from_query_response(&response)
}

/// Run a query to exhaustion and collect the ids it returns.
pub(crate) async fn collect_query_ids(
    rest: &dyn RestClient,
    query: &str,
    id_field: &str,
) -> Result<HashSet<String>> {
    let mut ids = HashSet::new();
    let response = rest.execute(RestRequest::soql(query)).await?;
    let mut page = FetchPage::from_query_response(&response)?;
    loop {
        ids.extend(page.records.iter().filter_map(|r| record_id(r, id_field)));
        match page.continuation {
            Some(Continuation::NextRecordsUrl(url)) => page = query_more(rest, &url).await?,
            _ => break,
        }
    }
    Ok(ids)
}

/// Save records into the context soup, matched on `id_field`.
///
/// Under [`MergeMode::LeaveIfChanged`] records whose local copy is dirty are
/// skipped.
pub(crate) fn save_records_to_soup(
    ctx: &SyncContext<'_>,
    id_field: &str,
    records: Vec<Value>,
) -> Result<usize> {
    let skipped = if ctx.options.merge_mode == MergeMode::LeaveIfChanged {
        dirty_record_ids(ctx.store, ctx.soup_name, id_field)?
    } else {
        HashSet::new()
    };

    let records: Vec<Value> = records
        .into_iter()
        .filter(|r| record_id(r, id_field).map_or(true, |id| !skipped.contains(&id)))
        .map(|mut r| {
            mark_clean(&mut r, ctx.sync_id);
            r
        })
        .collect();
    let saved = records.len();
    ctx.store
        .upsert_entries(ctx.soup_name, records, Some(id_field))?;
    debug!(
        sync_id = ctx.sync_id,
        soup = ctx.soup_name,
        records = saved,
        "saved records"
    );
    Ok(saved)
}

/// Remove clean local records of `soup_name` missing from `remote_ids`.
pub(crate) fn remove_ghosts(
    ctx: &SyncContext<'_>,
    soup_name: &str,
    id_field: &str,
    remote_ids: &HashSet<String>,
) -> Result<usize> {
    let ghosts = ghost_ids(ctx, soup_name, id_field, remote_ids)?;
    let entry_ids = entry_ids_for(ctx.store, soup_name, id_field, &ghosts)?;
    ctx.store.remove_entries(soup_name, &entry_ids)?;
    debug!(
        sync_id = ctx.sync_id,
        soup = soup_name,
        records = entry_ids.len(),
        "removed ghost records"
    );
    Ok(entry_ids.len())
}

pub(crate) fn ghost_ids(
    ctx: &SyncContext<'_>,
    soup_name: &str,
    id_field: &str,
    remote_ids: &HashSet<String>,
) -> Result<Vec<String>> {
    let predicate = sync_id_predicate(ctx, soup_name);
    Ok(non_dirty_record_ids(ctx.store, soup_name, id_field, &predicate)?
        .into_iter()
        .filter(|id| !remote_ids.contains(id))
        .collect())
}

pub(crate) fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidSyncConfig(format!("{} must not be empty", what)));
    }
    Ok(())
}
