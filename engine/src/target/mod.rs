//! Sync targets - how one direction of a sync talks to the remote source.
//!
//! Down targets fetch pages of remote records and save them into a soup;
//! up targets push locally dirty records. Both are closed enums dispatched
//! by `match`, with serde tags matching the sync config format.
//!
//! Application records carry bookkeeping fields maintained here:
//!
//! - [`LOCAL`] aggregate dirty flag, plus [`LOCALLY_CREATED`],
//!   [`LOCALLY_UPDATED`] and [`LOCALLY_DELETED`]
//! - [`SYNC_ID`] the sync that last wrote the record
//! - [`LAST_ERROR`] the last up-sync failure

pub mod composite;
pub mod down;
pub mod up;

use crate::query::QuerySpec;
use crate::rest::RestClient;
use crate::sync_state::SyncOptions;
use crate::{error::Result, json_path, EntryId, SoupStore, SyncId};
use serde_json::Value;
use std::collections::HashSet;

pub const LOCAL: &str = "__local__";
pub const LOCALLY_CREATED: &str = "__locally_created__";
pub const LOCALLY_UPDATED: &str = "__locally_updated__";
pub const LOCALLY_DELETED: &str = "__locally_deleted__";
pub const SYNC_ID: &str = "__sync_id__";
pub const LAST_ERROR: &str = "__last_error__";

pub const DEFAULT_ID_FIELD: &str = "Id";
pub const DEFAULT_MODIFICATION_DATE_FIELD: &str = "LastModifiedDate";

/// Page size used when reading local records.
pub const PAGE_SIZE: usize = 2000;

pub(crate) fn default_id_field() -> String {
    DEFAULT_ID_FIELD.to_string()
}

pub(crate) fn default_modification_date_field() -> String {
    DEFAULT_MODIFICATION_DATE_FIELD.to_string()
}

/// Everything a target needs during one sync run.
pub struct SyncContext<'a> {
    pub store: &'a SoupStore,
    pub rest: &'a dyn RestClient,
    pub sync_id: SyncId,
    pub soup_name: &'a str,
    pub options: &'a SyncOptions,
}

impl<'a> SyncContext<'a> {
    pub fn new(
        store: &'a SoupStore,
        rest: &'a dyn RestClient,
        sync_id: SyncId,
        soup_name: &'a str,
        options: &'a SyncOptions,
    ) -> Self {
        Self {
            store,
            rest,
            sync_id,
            soup_name,
            options,
        }
    }

    /// Same context pointed at another soup.
    pub fn for_soup(&self, soup_name: &'a str) -> SyncContext<'a> {
        SyncContext {
            store: self.store,
            rest: self.rest,
            sync_id: self.sync_id,
            soup_name,
            options: self.options,
        }
    }
}

// ----------------------------------------------------------------------
// Record bookkeeping
// ----------------------------------------------------------------------

pub fn is_dirty(record: &Value) -> bool {
    json_path::flag(record, LOCAL)
}

pub fn is_locally_created(record: &Value) -> bool {
    json_path::flag(record, LOCALLY_CREATED)
}

pub fn is_locally_updated(record: &Value) -> bool {
    json_path::flag(record, LOCALLY_UPDATED)
}

pub fn is_locally_deleted(record: &Value) -> bool {
    json_path::flag(record, LOCALLY_DELETED)
}

/// Mark a record as matching the server, written by `sync_id`.
pub fn mark_clean(record: &mut Value, sync_id: SyncId) {
    if let Some(map) = record.as_object_mut() {
        map.insert(LOCAL.into(), Value::Bool(false));
        map.insert(LOCALLY_CREATED.into(), Value::Bool(false));
        map.insert(LOCALLY_UPDATED.into(), Value::Bool(false));
        map.insert(LOCALLY_DELETED.into(), Value::Bool(false));
        map.insert(SYNC_ID.into(), Value::from(sync_id));
        map.remove(LAST_ERROR);
    }
}

/// Set the dirty flags the way application CRUD does.
pub fn mark_dirty(record: &mut Value, created: bool, updated: bool, deleted: bool) {
    if let Some(map) = record.as_object_mut() {
        map.insert(LOCAL.into(), Value::Bool(created || updated || deleted));
        map.insert(LOCALLY_CREATED.into(), Value::Bool(created));
        map.insert(LOCALLY_UPDATED.into(), Value::Bool(updated));
        map.insert(LOCALLY_DELETED.into(), Value::Bool(deleted));
    }
}

pub fn entry_id(record: &Value) -> Option<EntryId> {
    record.get(crate::index::SOUP_ENTRY_ID).and_then(Value::as_i64)
}

/// String id of a record at `id_field`.
pub fn record_id(record: &Value, id_field: &str) -> Option<String> {
    match json_path::project(record, id_field)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Latest modification time among `records`, or -1.
pub fn latest_modification_time_stamp(records: &[Value], mod_date_field: &str) -> i64 {
    records
        .iter()
        .filter_map(|r| json_path::project_str(r, mod_date_field))
        .filter_map(crate::soql::from_iso)
        .max()
        .unwrap_or(-1)
}

// ----------------------------------------------------------------------
// Local reads
// ----------------------------------------------------------------------

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Predicate restricting to records written by this sync, when the soup
/// indexes [`SYNC_ID`].
pub(crate) fn sync_id_predicate(ctx: &SyncContext<'_>, soup_name: &str) -> String {
    if ctx.store.has_index(soup_name, SYNC_ID) {
        format!("AND {{{}:{}}} = {}", soup_name, SYNC_ID, ctx.sync_id)
    } else {
        String::new()
    }
}

fn first_column_strings(rows: Vec<Value>) -> Vec<String> {
    rows.into_iter()
        .filter_map(|row| match row.get(0) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}

/// Server ids of local records that are not dirty.
pub fn non_dirty_record_ids(
    store: &SoupStore,
    soup_name: &str,
    id_field: &str,
    additional_predicate: &str,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT {{{s}:{id}}} FROM {{{s}}} WHERE ({{{s}:{local}}} = 0 OR {{{s}:{local}}} IS NULL) {extra} \
         ORDER BY {{{s}:{id}}} ASC",
        s = soup_name,
        id = id_field,
        local = LOCAL,
        extra = additional_predicate
    );
    Ok(first_column_strings(
        store.query_all(&QuerySpec::smart(sql, PAGE_SIZE))?,
    ))
}

/// Server ids of local records that are dirty.
pub fn dirty_record_ids(store: &SoupStore, soup_name: &str, id_field: &str) -> Result<HashSet<String>> {
    let sql = format!(
        "SELECT {{{s}:{id}}} FROM {{{s}}} WHERE {{{s}:{local}}} = 1",
        s = soup_name,
        id = id_field,
        local = LOCAL
    );
    Ok(first_column_strings(store.query_all(&QuerySpec::smart(sql, PAGE_SIZE))?)
        .into_iter()
        .collect())
}

/// Dirty records of a soup, oldest first.
pub fn dirty_records(store: &SoupStore, soup_name: &str) -> Result<Vec<Value>> {
    let sql = format!(
        "SELECT {{{s}:_soup}} FROM {{{s}}} WHERE {{{s}:{local}}} = 1 ORDER BY {{{s}:_soupEntryId}} ASC",
        s = soup_name,
        local = LOCAL
    );
    Ok(store
        .query_all(&QuerySpec::smart(sql, PAGE_SIZE))?
        .into_iter()
        .filter_map(|row| row.get(0).cloned())
        .collect())
}

/// Local records whose `field` equals `value`.
pub fn records_where(
    store: &SoupStore,
    soup_name: &str,
    field: &str,
    value: &str,
) -> Result<Vec<Value>> {
    let sql = format!(
        "SELECT {{{s}:_soup}} FROM {{{s}}} WHERE {{{s}:{f}}} = '{v}' ORDER BY {{{s}:_soupEntryId}} ASC",
        s = soup_name,
        f = field,
        v = escape_literal(value)
    );
    Ok(store
        .query_all(&QuerySpec::smart(sql, PAGE_SIZE))?
        .into_iter()
        .filter_map(|row| row.get(0).cloned())
        .collect())
}

/// Soup entry ids of the records whose `id_field` is one of `ids`.
pub fn entry_ids_for(
    store: &SoupStore,
    soup_name: &str,
    id_field: &str,
    ids: &[String],
) -> Result<Vec<EntryId>> {
    let mut entry_ids = Vec::new();
    for chunk in ids.chunks(500) {
        let list = chunk
            .iter()
            .map(|id| format!("'{}'", escape_literal(id)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {{{s}:_soupEntryId}} FROM {{{s}}} WHERE {{{s}:{id}}} IN ({list})",
            s = soup_name,
            id = id_field,
            list = list
        );
        entry_ids.extend(
            store
                .query_all(&QuerySpec::smart(sql, PAGE_SIZE))?
                .iter()
                .filter_map(|row| row.get(0).and_then(Value::as_i64)),
        );
    }
    Ok(entry_ids)
}
