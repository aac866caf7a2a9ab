use super::{require, FetchPage};
use crate::rest::RestRequest;
use crate::target::{default_id_field, default_modification_date_field, record_id, SyncContext};
use crate::{error::Result, soql, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Fetches the most recently viewed records of one object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MruTarget {
    #[serde(rename = "sobjectType")]
    pub object_type: String,
    #[serde(rename = "fieldlist")]
    pub field_list: Vec<String>,
    #[serde(default = "default_id_field")]
    pub id_field_name: String,
    #[serde(default = "default_modification_date_field")]
    pub modification_date_field_name: String,
}

impl MruTarget {
    pub fn new(object_type: impl Into<String>, field_list: &[&str]) -> Self {
        Self {
            object_type: object_type.into(),
            field_list: field_list.iter().map(|f| f.to_string()).collect(),
            id_field_name: default_id_field(),
            modification_date_field_name: default_modification_date_field(),
        }
    }

    pub(super) fn validate(&self) -> Result<()> {
        require(&self.object_type, "sobjectType")?;
        if self.field_list.is_empty() {
            return Err(Error::InvalidSyncConfig("fieldlist must not be empty".into()));
        }
        Ok(())
    }

    fn recently_viewed_query(&self) -> String {
        format!(
            "SELECT {} FROM RecentlyViewed WHERE Type = {} ORDER BY LastViewedDate DESC",
            self.id_field_name,
            soql::quote_ids(&[self.object_type.as_str()])
        )
    }

    async fn recent_ids(&self, ctx: &SyncContext<'_>) -> Result<Vec<String>> {
        let response = ctx
            .rest
            .execute(RestRequest::soql(&self.recently_viewed_query()))
            .await?;
        Ok(FetchPage::from_query_response(&response)?
            .records
            .iter()
            .filter_map(|r| record_id(r, &self.id_field_name))
            .collect())
    }

    /// Query fetching the full records of `ids`.
    pub fn records_query(&self, ids: &[String]) -> String {
        let fields: Vec<&str> = self.field_list.iter().map(String::as_str).collect();
        let query = format!(
            "SELECT {} FROM {} WHERE {} IN ({})",
            fields.join(", "),
            self.object_type,
            self.id_field_name,
            soql::quote_ids(ids)
        );
        soql::ensure_selected(
            &query,
            &[
                self.id_field_name.as_str(),
                self.modification_date_field_name.as_str(),
            ],
        )
    }

    pub(super) async fn start_fetch(&self, ctx: &SyncContext<'_>) -> Result<FetchPage> {
        let ids = self.recent_ids(ctx).await?;
        if ids.is_empty() {
            return Ok(FetchPage::empty());
        }
        let response = ctx
            .rest
            .execute(RestRequest::soql(&self.records_query(&ids)))
            .await?;
        FetchPage::from_query_response(&response)
    }

    pub(super) async fn fetch_remote_ids(&self, ctx: &SyncContext<'_>) -> Result<HashSet<String>> {
        Ok(self.recent_ids(ctx).await?.into_iter().collect())
    }
}
