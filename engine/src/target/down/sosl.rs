use super::{require, FetchPage};
use crate::rest::{RestError, RestRequest};
use crate::target::{default_id_field, default_modification_date_field, record_id, SyncContext};
use crate::{error::Result, soql, Error, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Fetches the records of a SOSL search. Searches are not paged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoslTarget {
    pub query: String,
    #[serde(default = "default_id_field")]
    pub id_field_name: String,
    #[serde(default = "default_modification_date_field")]
    pub modification_date_field_name: String,
}

impl SoslTarget {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            id_field_name: default_id_field(),
            modification_date_field_name: default_modification_date_field(),
        }
    }

    pub(super) fn validate(&self) -> Result<()> {
        require(&self.query, "sosl query")
    }

    async fn search(&self, ctx: &SyncContext<'_>, search: &str) -> Result<Vec<Value>> {
        let response = ctx.rest.execute(RestRequest::sosl(search)).await?;
        search_records(response)
    }

    pub(super) async fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        max_time_stamp: Timestamp,
    ) -> Result<FetchPage> {
        let search = soql::add_modified_since_sosl(
            &self.query,
            &self.id_field_name,
            &self.modification_date_field_name,
            max_time_stamp,
        );
        Ok(FetchPage::new(self.search(ctx, &search).await?))
    }

    pub(super) async fn fetch_remote_ids(&self, ctx: &SyncContext<'_>) -> Result<HashSet<String>> {
        Ok(self
            .search(ctx, &self.query)
            .await?
            .iter()
            .filter_map(|r| record_id(r, &self.id_field_name))
            .collect())
    }
}

/// Search results come back either as a bare array or wrapped in
/// `searchRecords`.
fn search_records(response: Value) -> Result<Vec<Value>> {
    match response {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => match map.remove("searchRecords") {
            Some(Value::Array(records)) => Ok(records),
            _ => Err(Error::Remote(RestError::UnexpectedResponse(
                "search response without searchRecords".into(),
            ))),
        },
        _ => Err(Error::Remote(RestError::UnexpectedResponse(
            "search response is not a list".into(),
        ))),
    }
}
