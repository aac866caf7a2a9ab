//! Record-by-record create, update and delete.
//!
//! Both CRUD targets share one pipeline: plan a request per record, send
//! the requests (one by one or as composite calls), then apply each
//! response locally. Under leave-if-changed the remote modification dates
//! are read up front with one query per object type.

use super::SyncUpOutcome;
use crate::rest::{RestError, RestRequest, MAX_COMPOSITE_SUBREQUESTS};
use crate::sync_state::MergeMode;
use crate::target::composite::{
    send_composite, send_single, RecordRequest, RecordRequestKind, RecordResponse,
};
use crate::target::{
    default_id_field, default_modification_date_field, entry_id, is_locally_created,
    is_locally_deleted, mark_clean, record_id, SyncContext, LAST_ERROR,
};
use crate::{error::Result, json_path, soql, Error, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

const ATTRIBUTES: &str = "attributes";

/// Ids queried per remote modification date lookup.
const IDS_PER_LOOKUP: usize = 200;

fn default_max_batch_size() -> usize {
    MAX_COMPOSITE_SUBREQUESTS
}

/// Default sync up target: one REST call per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestTarget {
    /// Object type written to; falls back to each record's `attributes.type`
    #[serde(default, rename = "sobjectType", skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(default, rename = "createFieldlist", skip_serializing_if = "Vec::is_empty")]
    pub create_field_list: Vec<String>,
    #[serde(default, rename = "updateFieldlist", skip_serializing_if = "Vec::is_empty")]
    pub update_field_list: Vec<String>,
    #[serde(default = "default_id_field")]
    pub id_field_name: String,
    #[serde(default = "default_modification_date_field")]
    pub modification_date_field_name: String,
}

impl Default for RestTarget {
    fn default() -> Self {
        Self {
            object_type: None,
            create_field_list: Vec::new(),
            update_field_list: Vec::new(),
            id_field_name: default_id_field(),
            modification_date_field_name: default_modification_date_field(),
        }
    }
}

impl RestTarget {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: Some(object_type.into()),
            ..Self::default()
        }
    }

    pub(super) fn validate(&self) -> Result<()> {
        validate_fields(&self.id_field_name, &self.modification_date_field_name)
    }

    fn fields(&self) -> RecordFields<'_> {
        RecordFields {
            object_type: self.object_type.as_deref(),
            id_field: &self.id_field_name,
            modification_date_field: &self.modification_date_field_name,
            create_fields: &self.create_field_list,
            update_fields: &self.update_field_list,
        }
    }

    pub(super) async fn sync_up(
        &self,
        ctx: &SyncContext<'_>,
        records: Vec<Value>,
    ) -> Result<Vec<SyncUpOutcome>> {
        sync_up_records(ctx, &self.fields(), records, Dispatch::Single).await
    }
}

/// Sync up target grouping records into composite calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTarget {
    #[serde(default, rename = "sobjectType", skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(default, rename = "createFieldlist", skip_serializing_if = "Vec::is_empty")]
    pub create_field_list: Vec<String>,
    #[serde(default, rename = "updateFieldlist", skip_serializing_if = "Vec::is_empty")]
    pub update_field_list: Vec<String>,
    #[serde(default = "default_id_field")]
    pub id_field_name: String,
    #[serde(default = "default_modification_date_field")]
    pub modification_date_field_name: String,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl BatchTarget {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: Some(object_type.into()),
            create_field_list: Vec::new(),
            update_field_list: Vec::new(),
            id_field_name: default_id_field(),
            modification_date_field_name: default_modification_date_field(),
            max_batch_size: MAX_COMPOSITE_SUBREQUESTS,
        }
    }

    pub(super) fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 || self.max_batch_size > MAX_COMPOSITE_SUBREQUESTS {
            return Err(Error::InvalidSyncConfig(format!(
                "maxBatchSize must be between 1 and {}",
                MAX_COMPOSITE_SUBREQUESTS
            )));
        }
        validate_fields(&self.id_field_name, &self.modification_date_field_name)
    }

    fn fields(&self) -> RecordFields<'_> {
        RecordFields {
            object_type: self.object_type.as_deref(),
            id_field: &self.id_field_name,
            modification_date_field: &self.modification_date_field_name,
            create_fields: &self.create_field_list,
            update_fields: &self.update_field_list,
        }
    }

    pub(super) async fn sync_up(
        &self,
        ctx: &SyncContext<'_>,
        records: Vec<Value>,
    ) -> Result<Vec<SyncUpOutcome>> {
        sync_up_records(ctx, &self.fields(), records, Dispatch::Composite).await
    }
}

fn validate_fields(id_field: &str, modification_date_field: &str) -> Result<()> {
    if id_field.trim().is_empty() || modification_date_field.trim().is_empty() {
        return Err(Error::InvalidSyncConfig(
            "idFieldName and modificationDateFieldName must not be empty".into(),
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Shared pipeline
// ----------------------------------------------------------------------

/// Field configuration of one object type.
#[derive(Debug, Clone, Copy)]
pub(super) struct RecordFields<'a> {
    pub object_type: Option<&'a str>,
    pub id_field: &'a str,
    pub modification_date_field: &'a str,
    pub create_fields: &'a [String],
    pub update_fields: &'a [String],
}

impl RecordFields<'_> {
    pub fn object_type_of(&self, record: &Value) -> Option<String> {
        self.object_type.map(String::from).or_else(|| {
            json_path::project_str(record, &format!("{}.type", ATTRIBUTES)).map(String::from)
        })
    }

    /// Fields sent for a create or update.
    ///
    /// The target's own list wins, then the sync's `fieldlist`, then every
    /// top-level field that is not bookkeeping, the id or the modification
    /// date.
    pub fn payload(&self, ctx: &SyncContext<'_>, record: &Value, create: bool) -> Map<String, Value> {
        let own = if create {
            self.create_fields
        } else {
            self.update_fields
        };
        let list: Vec<&str> = if !own.is_empty() {
            own.iter().map(String::as_str).collect()
        } else if !ctx.options.field_list.is_empty() {
            ctx.options.field_list.iter().map(String::as_str).collect()
        } else {
            record
                .as_object()
                .map(|map| {
                    map.keys()
                        .map(String::as_str)
                        .filter(|k| !k.starts_with('_') && *k != ATTRIBUTES)
                        .collect()
                })
                .unwrap_or_default()
        };

        list.into_iter()
            .filter(|f| {
                !f.contains('.') && *f != self.id_field && *f != self.modification_date_field
            })
            .filter_map(|f| record.get(f).map(|v| (f.to_string(), v.clone())))
            .collect()
    }
}

/// How planned requests reach the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Dispatch {
    Single,
    Composite,
}

/// What to do with one dirty record.
#[derive(Debug)]
pub(super) enum Plan {
    /// Created and deleted locally; never reached the remote
    RemoveLocally,
    Conflict,
    Send(RecordRequest),
    Fail(String),
}

/// Remote modification dates keyed by id. Ids absent from the map no
/// longer exist remotely.
pub(super) type RemoteDates = HashMap<String, Option<Timestamp>>;

/// Read remote modification dates of `ids`, grouped by object type.
pub(super) async fn remote_modification_dates(
    ctx: &SyncContext<'_>,
    fields: &RecordFields<'_>,
    ids_by_type: &BTreeMap<String, Vec<String>>,
) -> Result<RemoteDates> {
    let mut dates = RemoteDates::new();
    for (object_type, ids) in ids_by_type {
        for chunk in ids.chunks(IDS_PER_LOOKUP) {
            let query = format!(
                "SELECT {id}, {modified} FROM {object} WHERE {id} IN ({ids})",
                id = fields.id_field,
                modified = fields.modification_date_field,
                object = object_type,
                ids = soql::quote_ids(chunk)
            );
            let response = ctx.rest.execute(RestRequest::soql(&query)).await?;
            let Some(records) = response.get("records").and_then(Value::as_array) else {
                return Err(RestError::UnexpectedResponse(format!(
                    "no records in modification date lookup for {}",
                    object_type
                ))
                .into());
            };
            for record in records {
                if let Some(id) = record_id(&record, fields.id_field) {
                    let modified = json_path::project_str(&record, fields.modification_date_field)
                        .and_then(soql::from_iso);
                    dates.insert(id, modified);
                }
            }
        }
    }
    Ok(dates)
}

/// Ids whose remote state matters for the leave-if-changed check.
pub(super) fn ids_to_check(fields: &RecordFields<'_>, records: &[Value]) -> BTreeMap<String, Vec<String>> {
    let mut ids_by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for record in records.iter().filter(|r| !is_locally_created(r)) {
        if let (Some(object_type), Some(id)) =
            (fields.object_type_of(record), record_id(record, fields.id_field))
        {
            ids_by_type.entry(object_type).or_default().push(id);
        }
    }
    ids_by_type
}

/// Whether the local change may overwrite the remote record.
///
/// Locally created records and records without a local modification date
/// always proceed. A record deleted remotely only proceeds when it was
/// deleted locally too. Otherwise the remote must not be strictly newer.
pub(super) fn is_newer_than_server(fields: &RecordFields<'_>, record: &Value, remote: &RemoteDates) -> bool {
    if is_locally_created(record) {
        return true;
    }
    let Some(local) = json_path::project_str(record, fields.modification_date_field)
        .and_then(soql::from_iso)
    else {
        return true;
    };
    let Some(id) = record_id(record, fields.id_field) else {
        return true;
    };
    match remote.get(&id) {
        None => is_locally_deleted(record),
        Some(None) => true,
        Some(Some(remote_modified)) => *remote_modified <= local,
    }
}

pub(super) fn plan(
    ctx: &SyncContext<'_>,
    fields: &RecordFields<'_>,
    record: &Value,
    remote: &RemoteDates,
    reference_id: String,
) -> Plan {
    let created = is_locally_created(record);
    let deleted = is_locally_deleted(record);
    if created && deleted {
        return Plan::RemoveLocally;
    }
    if ctx.options.merge_mode == MergeMode::LeaveIfChanged
        && !is_newer_than_server(fields, record, remote)
    {
        return Plan::Conflict;
    }
    let Some(object_type) = fields.object_type_of(record) else {
        return Plan::Fail("record has no object type".into());
    };
    let id = record_id(record, fields.id_field);

    if deleted {
        return match id {
            Some(id) => Plan::Send(RecordRequest::delete(&object_type, &id, reference_id)),
            None => Plan::RemoveLocally,
        };
    }
    if created {
        return Plan::Send(RecordRequest::create(
            &object_type,
            fields.payload(ctx, record, true),
            reference_id,
        ));
    }
    match id {
        Some(id) => Plan::Send(RecordRequest::update(
            &object_type,
            &id,
            fields.payload(ctx, record, false),
            reference_id,
        )),
        None => Plan::Fail(format!("record has no {}", fields.id_field)),
    }
}

/// Result of applying one remote response locally.
#[derive(Debug)]
pub(super) enum Applied {
    Done(SyncUpOutcome),
    /// The update hit a deleted record and must be re-created
    Recreate(RecordRequest),
}

pub(super) fn remove_locally(ctx: &SyncContext<'_>, record: &Value) -> Result<()> {
    if let Some(id) = entry_id(record) {
        ctx.store.remove_entries(ctx.soup_name, &[id])?;
    }
    Ok(())
}

pub(super) fn save_locally(ctx: &SyncContext<'_>, record: &mut Value) -> Result<()> {
    *record = ctx.store.upsert_entry(ctx.soup_name, record.take(), None)?;
    Ok(())
}

/// Keep the record dirty and remember why it failed.
pub(super) fn record_failure(
    ctx: &SyncContext<'_>,
    record: &mut Value,
    message: &str,
) -> Result<SyncUpOutcome> {
    warn!(
        sync_id = ctx.sync_id,
        soup = ctx.soup_name,
        error = message,
        "sync up failed for record"
    );
    json_path::set(record, LAST_ERROR, Value::String(message.to_string()));
    save_locally(ctx, record)?;
    Ok(SyncUpOutcome::Failed(message.to_string()))
}

pub(super) fn apply_response(
    ctx: &SyncContext<'_>,
    fields: &RecordFields<'_>,
    record: &mut Value,
    request: &RecordRequest,
    response: &RecordResponse,
) -> Result<Applied> {
    match request.kind {
        RecordRequestKind::Delete if response.success || response.record_does_not_exist => {
            remove_locally(ctx, record)?;
            return Ok(Applied::Done(SyncUpOutcome::Applied));
        }
        RecordRequestKind::Update
            if response.record_does_not_exist
                && ctx.options.merge_mode == MergeMode::Overwrite =>
        {
            let recreate = RecordRequest::create(
                &request.object_type,
                fields.payload(ctx, record, true),
                request.reference_id.clone(),
            );
            return Ok(Applied::Recreate(recreate));
        }
        _ => {}
    }

    if !response.success {
        let outcome = record_failure(ctx, record, &response.error_message())?;
        return Ok(Applied::Done(outcome));
    }
    if request.kind == RecordRequestKind::Create {
        if let Some(new_id) = &response.record_id {
            json_path::set(record, fields.id_field, Value::String(new_id.clone()));
        }
    }
    mark_clean(record, ctx.sync_id);
    save_locally(ctx, record)?;
    Ok(Applied::Done(SyncUpOutcome::Applied))
}

/// Send requests and key the responses by reference id. A transport
/// failure fails every request it covers.
pub(super) async fn dispatch(
    ctx: &SyncContext<'_>,
    requests: &[RecordRequest],
    mode: Dispatch,
    all_or_none: bool,
) -> HashMap<String, std::result::Result<RecordResponse, String>> {
    let mut responses = HashMap::new();
    match mode {
        Dispatch::Single => {
            for request in requests {
                let response = send_single(ctx.rest, request)
                    .await
                    .map_err(|e| e.to_string());
                responses.insert(request.reference_id.clone(), response);
            }
        }
        Dispatch::Composite => match send_composite(ctx.rest, all_or_none, requests).await {
            Ok(sent) => {
                for request in requests {
                    let response = sent
                        .get(&request.reference_id)
                        .cloned()
                        .ok_or_else(|| "missing composite subresponse".to_string());
                    responses.insert(request.reference_id.clone(), response);
                }
            }
            Err(e) => {
                for request in requests {
                    responses.insert(request.reference_id.clone(), Err(e.to_string()));
                }
            }
        },
    }
    responses
}

/// Refresh the local modification date of applied records from the
/// remote. Failures only leave the local date stale.
async fn refresh_modification_dates(
    ctx: &SyncContext<'_>,
    fields: &RecordFields<'_>,
    records: &mut [Value],
) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let dates = match remote_modification_dates(ctx, fields, &ids_to_check(fields, records)).await
    {
        Ok(dates) => dates,
        Err(e) => {
            debug!(sync_id = ctx.sync_id, error = %e, "could not refresh modification dates");
            return Ok(());
        }
    };
    for record in records.iter_mut() {
        let modified = record_id(record, fields.id_field)
            .and_then(|id| dates.get(&id).copied().flatten());
        if let Some(modified) = modified {
            json_path::set(
                record,
                fields.modification_date_field,
                Value::String(soql::to_iso(modified)),
            );
            save_locally(ctx, record)?;
        }
    }
    Ok(())
}

/// Push `records` and return one outcome per record, in order.
pub(super) async fn sync_up_records(
    ctx: &SyncContext<'_>,
    fields: &RecordFields<'_>,
    mut records: Vec<Value>,
    mode: Dispatch,
) -> Result<Vec<SyncUpOutcome>> {
    let remote = if ctx.options.merge_mode == MergeMode::LeaveIfChanged {
        match remote_modification_dates(ctx, fields, &ids_to_check(fields, &records)).await {
            Ok(dates) => dates,
            Err(Error::Remote(e)) => {
                let message = e.to_string();
                return records
                    .iter_mut()
                    .map(|r| record_failure(ctx, r, &message))
                    .collect();
            }
            Err(e) => return Err(e),
        }
    } else {
        RemoteDates::new()
    };

    let mut outcomes: Vec<Option<SyncUpOutcome>> = vec![None; records.len()];
    let mut pending: Vec<(usize, RecordRequest)> = Vec::new();
    for (i, record) in records.iter_mut().enumerate() {
        match plan(ctx, fields, record, &remote, format!("refUp{}", i)) {
            Plan::RemoveLocally => {
                remove_locally(ctx, record)?;
                outcomes[i] = Some(SyncUpOutcome::Applied);
            }
            Plan::Conflict => {
                warn!(
                    sync_id = ctx.sync_id,
                    soup = ctx.soup_name,
                    "remote record changed, leaving local record dirty"
                );
                outcomes[i] = Some(SyncUpOutcome::Conflict);
            }
            Plan::Fail(message) => outcomes[i] = Some(record_failure(ctx, record, &message)?),
            Plan::Send(request) => pending.push((i, request)),
        }
    }

    while !pending.is_empty() {
        let requests: Vec<RecordRequest> = pending.iter().map(|(_, r)| r.clone()).collect();
        let mut responses = dispatch(ctx, &requests, mode, false).await;
        let mut retries = Vec::new();
        for (i, request) in pending {
            let record = &mut records[i];
            let applied = match responses.remove(&request.reference_id) {
                Some(Ok(response)) => apply_response(ctx, fields, record, &request, &response)?,
                Some(Err(message)) => Applied::Done(record_failure(ctx, record, &message)?),
                None => Applied::Done(record_failure(ctx, record, "no response")?),
            };
            match applied {
                Applied::Done(outcome) => outcomes[i] = Some(outcome),
                Applied::Recreate(create) => retries.push((i, create)),
            }
        }
        pending = retries;
    }

    let mut refreshed: Vec<Value> = records
        .iter()
        .zip(&outcomes)
        .filter(|(r, o)| {
            matches!(o, Some(SyncUpOutcome::Applied)) && !is_locally_deleted(r) && entry_id(r).is_some()
        })
        .map(|(r, _)| r.clone())
        .collect();
    refresh_modification_dates(ctx, fields, &mut refreshed).await?;

    Ok(outcomes
        .into_iter()
        .map(|o| o.unwrap_or_else(|| SyncUpOutcome::Failed("not processed".into())))
        .collect())
}
