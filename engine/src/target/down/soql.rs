use super::{collect_query_ids, require, FetchPage};
use crate::rest::RestRequest;
use crate::target::{default_id_field, default_modification_date_field, SyncContext};
use crate::{error::Result, soql, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Fetches the records of a SOQL query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoqlTarget {
    pub query: String,
    #[serde(default = "default_id_field")]
    pub id_field_name: String,
    #[serde(default = "default_modification_date_field")]
    pub modification_date_field_name: String,
}

impl SoqlTarget {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            id_field_name: default_id_field(),
            modification_date_field_name: default_modification_date_field(),
        }
    }

    pub(super) fn validate(&self) -> Result<()> {
        require(&self.query, "soql query")
    }

    /// The query sent for a fetch starting after `max_time_stamp`.
    pub fn query_for(&self, max_time_stamp: Timestamp) -> String {
        let query = soql::ensure_selected(
            &self.query,
            &[
                self.id_field_name.as_str(),
                self.modification_date_field_name.as_str(),
            ],
        );
        soql::add_modified_since(&query, &self.modification_date_field_name, max_time_stamp)
    }

    pub(super) async fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        max_time_stamp: Timestamp,
    ) -> Result<FetchPage> {
        let response = ctx
            .rest
            .execute(RestRequest::soql(&self.query_for(max_time_stamp)))
            .await?;
        FetchPage::from_query_response(&response)
    }

    pub(super) async fn fetch_remote_ids(&self, ctx: &SyncContext<'_>) -> Result<HashSet<String>> {
        let query = soql::with_select_list(&self.query, &[self.id_field_name.as_str()]);
        collect_query_ids(ctx.rest, &query, &self.id_field_name).await
    }
}
