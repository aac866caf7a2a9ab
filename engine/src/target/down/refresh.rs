use super::{require, Continuation, FetchPage};
use crate::query::QuerySpec;
use crate::rest::RestRequest;
use crate::target::{
    default_id_field, default_modification_date_field, record_id, SyncContext, LOCALLY_CREATED,
    PAGE_SIZE,
};
use crate::{error::Result, soql, Error, SoupStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

const DEFAULT_COUNT_IDS_PER_SOQL: usize = 500;

fn default_count_ids_per_soql() -> usize {
    DEFAULT_COUNT_IDS_PER_SOQL
}

/// Re-fetches records already held locally, by id.
///
/// The ids come from `ids` when configured, otherwise from every record of
/// the sync soup that exists remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTarget {
    #[serde(rename = "sobjectType")]
    pub object_type: String,
    #[serde(rename = "fieldlist")]
    pub field_list: Vec<String>,
    #[serde(default = "default_count_ids_per_soql")]
    pub count_ids_per_soql: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default = "default_id_field")]
    pub id_field_name: String,
    #[serde(default = "default_modification_date_field")]
    pub modification_date_field_name: String,
}

impl RefreshTarget {
    pub fn new(object_type: impl Into<String>, field_list: &[&str]) -> Self {
        Self {
            object_type: object_type.into(),
            field_list: field_list.iter().map(|f| f.to_string()).collect(),
            count_ids_per_soql: DEFAULT_COUNT_IDS_PER_SOQL,
            ids: Vec::new(),
            id_field_name: default_id_field(),
            modification_date_field_name: default_modification_date_field(),
        }
    }

    pub fn with_ids(mut self, ids: &[&str]) -> Self {
        self.ids = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub(super) fn validate(&self) -> Result<()> {
        require(&self.object_type, "sobjectType")?;
        if self.field_list.is_empty() {
            return Err(Error::InvalidSyncConfig("fieldlist must not be empty".into()));
        }
        if self.count_ids_per_soql == 0 {
            return Err(Error::InvalidSyncConfig(
                "countIdsPerSoql must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Server ids of the local records, skipping ones only created locally.
    fn local_ids(&self, store: &SoupStore, soup_name: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT {{{s}:{id}}} FROM {{{s}}} \
             WHERE {{{s}:{created}}} = 0 OR {{{s}:{created}}} IS NULL \
             ORDER BY {{{s}:_soupEntryId}} ASC",
            s = soup_name,
            id = self.id_field_name,
            created = LOCALLY_CREATED
        );
        Ok(store
            .query_all(&QuerySpec::smart(sql, PAGE_SIZE))?
            .iter()
            .filter_map(|row| row.get(0).and_then(Value::as_str))
            .map(String::from)
            .collect())
    }

    fn ids_to_refresh(&self, ctx: &SyncContext<'_>) -> Result<Vec<String>> {
        if self.ids.is_empty() {
            self.local_ids(ctx.store, ctx.soup_name)
        } else {
            Ok(self.ids.clone())
        }
    }

    fn slice_query(&self, fields: &[&str], ids: &[String]) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} IN ({})",
            fields.join(", "),
            self.object_type,
            self.id_field_name,
            soql::quote_ids(ids)
        )
    }

    fn records_query(&self, ids: &[String]) -> String {
        let fields: Vec<&str> = self.field_list.iter().map(String::as_str).collect();
        soql::ensure_selected(
            &self.slice_query(&fields, ids),
            &[
                self.id_field_name.as_str(),
                self.modification_date_field_name.as_str(),
            ],
        )
    }

    pub(super) async fn start_fetch(&self, ctx: &SyncContext<'_>) -> Result<FetchPage> {
        let ids = self.ids_to_refresh(ctx)?;
        let mut page = self.fetch_slice(ctx, &ids).await?;
        page.total_size = Some(ids.len() as i64);
        Ok(page)
    }

    /// Fetch the next `countIdsPerSoql` ids of `ids`.
    pub(super) async fn fetch_slice(
        &self,
        ctx: &SyncContext<'_>,
        ids: &[String],
    ) -> Result<FetchPage> {
        if ids.is_empty() {
            return Ok(FetchPage::empty());
        }
        let split = ids.len().min(self.count_ids_per_soql);
        let (slice, rest) = ids.split_at(split);
        let response = ctx
            .rest
            .execute(RestRequest::soql(&self.records_query(slice)))
            .await?;
        let page = FetchPage::from_query_response(&response)?;
        Ok(FetchPage {
            records: page.records,
            total_size: None,
            continuation: (!rest.is_empty()).then(|| Continuation::RemainingIds(rest.to_vec())),
        })
    }

    pub(super) async fn fetch_remote_ids(&self, ctx: &SyncContext<'_>) -> Result<HashSet<String>> {
        let mut remote = HashSet::new();
        let ids = self.ids_to_refresh(ctx)?;
        for slice in ids.chunks(self.count_ids_per_soql) {
            let query = self.slice_query(&[self.id_field_name.as_str()], slice);
            let response = ctx.rest.execute(RestRequest::soql(&query)).await?;
            remote.extend(
                FetchPage::from_query_response(&response)?
                    .records
                    .iter()
                    .filter_map(|r| record_id(r, &self.id_field_name)),
            );
        }
        Ok(remote)
    }
}
