//! Single-record targets caching object metadata.
//!
//! Each fetch returns exactly one record keyed by a synthetic `Id`, so a
//! resync replaces the cached copy in place.

use super::{require, FetchPage};
use crate::error::Result;
use crate::rest::RestRequest;
use crate::target::{SyncContext, DEFAULT_ID_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn keyed(record: Value, id: String) -> FetchPage {
    let mut map = match record {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    map.insert(DEFAULT_ID_FIELD.to_string(), Value::String(id));
    FetchPage::new(vec![Value::Object(map)])
}

/// Caches the describe result of an object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataTarget {
    #[serde(rename = "sobjectType")]
    pub object_type: String,
}

impl MetadataTarget {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
        }
    }

    pub(super) fn validate(&self) -> Result<()> {
        require(&self.object_type, "sobjectType")
    }

    pub(super) async fn start_fetch(&self, ctx: &SyncContext<'_>) -> Result<FetchPage> {
        let describe = ctx
            .rest
            .execute(RestRequest::describe(&self.object_type))
            .await?;
        Ok(keyed(describe, self.object_type.clone()))
    }
}

/// Caches a UI layout of an object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutTarget {
    #[serde(rename = "sobjectType")]
    pub object_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_factor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_type_id: Option<String>,
}

impl LayoutTarget {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            form_factor: None,
            layout_type: None,
            mode: None,
            record_type_id: None,
        }
    }

    pub(super) fn validate(&self) -> Result<()> {
        require(&self.object_type, "sobjectType")
    }

    /// Cache key: object type and every layout parameter, dash separated.
    pub fn layout_id(&self) -> String {
        [
            Some(self.object_type.as_str()),
            self.form_factor.as_deref(),
            self.layout_type.as_deref(),
            self.mode.as_deref(),
            self.record_type_id.as_deref(),
        ]
        .iter()
        .map(|part| part.unwrap_or(""))
        .collect::<Vec<_>>()
        .join("-")
    }

    pub(super) async fn start_fetch(&self, ctx: &SyncContext<'_>) -> Result<FetchPage> {
        let layout = ctx
            .rest
            .execute(RestRequest::layout(
                &self.object_type,
                self.form_factor.as_deref(),
                self.layout_type.as_deref(),
                self.mode.as_deref(),
                self.record_type_id.as_deref(),
            ))
            .await?;
        Ok(keyed(layout, self.layout_id()))
    }
}

/// Caches the picklist values of an object type for one record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PicklistTarget {
    #[serde(rename = "sobjectType")]
    pub object_type: String,
    pub record_type_id: String,
}

impl PicklistTarget {
    pub fn new(object_type: impl Into<String>, record_type_id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            record_type_id: record_type_id.into(),
        }
    }

    pub(super) fn validate(&self) -> Result<()> {
        require(&self.object_type, "sobjectType")?;
        require(&self.record_type_id, "recordTypeId")
    }

    pub(super) async fn start_fetch(&self, ctx: &SyncContext<'_>) -> Result<FetchPage> {
        let picklists = ctx
            .rest
            .execute(RestRequest::picklist(&self.object_type, &self.record_type_id))
            .await?;
        Ok(keyed(
            picklists,
            format!("{}-{}", self.object_type, self.record_type_id),
        ))
    }
}
