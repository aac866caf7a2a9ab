use super::{collect_query_ids, ghost_ids, require, FetchPage};
use crate::rest::RestRequest;
use crate::sync_state::MergeMode;
use crate::target::{
    default_id_field, default_modification_date_field, dirty_record_ids, entry_ids_for,
    latest_modification_time_stamp, mark_clean, record_id, SyncContext,
};
use crate::{error::Result, soql, Error, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Parent side of a parent/children sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentInfo {
    #[serde(rename = "sobjectType")]
    pub object_type: String,
    pub soup_name: String,
    #[serde(default = "default_id_field")]
    pub id_field_name: String,
    #[serde(default = "default_modification_date_field")]
    pub modification_date_field_name: String,
}

impl ParentInfo {
    pub fn new(object_type: impl Into<String>, soup_name: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            soup_name: soup_name.into(),
            id_field_name: default_id_field(),
            modification_date_field_name: default_modification_date_field(),
        }
    }
}

/// Children side of a parent/children sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildrenInfo {
    #[serde(rename = "sobjectType")]
    pub object_type: String,
    /// Relationship name used in the parent query, e.g. `Contacts`
    #[serde(rename = "sobjectTypePlural")]
    pub object_type_plural: String,
    pub soup_name: String,
    /// Field of a child holding its parent's id
    pub parent_id_field_name: String,
    #[serde(default = "default_id_field")]
    pub id_field_name: String,
    #[serde(default = "default_modification_date_field")]
    pub modification_date_field_name: String,
}

impl ChildrenInfo {
    pub fn new(
        object_type: impl Into<String>,
        object_type_plural: impl Into<String>,
        soup_name: impl Into<String>,
        parent_id_field_name: impl Into<String>,
    ) -> Self {
        Self {
            object_type: object_type.into(),
            object_type_plural: object_type_plural.into(),
            soup_name: soup_name.into(),
            parent_id_field_name: parent_id_field_name.into(),
            id_field_name: default_id_field(),
            modification_date_field_name: default_modification_date_field(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// Children cannot outlive their parent
    MasterDetail,
    Lookup,
}

/// Fetches parent records with their children and writes both soups in
/// one transaction per page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentChildrenTarget {
    pub parent: ParentInfo,
    pub children: ChildrenInfo,
    pub relationship_type: RelationshipType,
    #[serde(rename = "parentFieldlist")]
    pub parent_field_list: Vec<String>,
    #[serde(default)]
    pub parent_soql_filter: String,
    #[serde(rename = "childrenFieldlist")]
    pub children_field_list: Vec<String>,
}

impl ParentChildrenTarget {
    pub(super) fn validate(&self) -> Result<()> {
        require(&self.parent.object_type, "parent sobjectType")?;
        require(&self.parent.soup_name, "parent soupName")?;
        require(&self.children.object_type, "children sobjectType")?;
        require(&self.children.object_type_plural, "children sobjectTypePlural")?;
        require(&self.children.soup_name, "children soupName")?;
        require(&self.children.parent_id_field_name, "children parentIdFieldName")?;
        if self.parent.soup_name == self.children.soup_name {
            return Err(Error::InvalidSyncConfig(
                "parent and children must use different soups".into(),
            ));
        }
        Ok(())
    }

    fn parent_fields(&self) -> Vec<String> {
        with_required(
            &self.parent_field_list,
            &[
                &self.parent.id_field_name,
                &self.parent.modification_date_field_name,
            ],
        )
    }

    fn children_fields(&self) -> Vec<String> {
        with_required(
            &self.children_field_list,
            &[
                &self.children.id_field_name,
                &self.children.modification_date_field_name,
            ],
        )
    }

    /// Parent query with a nested children query, both restricted to
    /// records modified after `max_time_stamp` when positive.
    pub fn query_for(&self, max_time_stamp: Timestamp) -> String {
        let mut parent_where = Vec::new();
        let mut children_where = String::new();
        if max_time_stamp > 0 {
            parent_where.push(format!(
                "{} > {}",
                self.parent.modification_date_field_name,
                soql::to_iso(max_time_stamp)
            ));
            children_where = format!(
                " WHERE {} > {}",
                self.children.modification_date_field_name,
                soql::to_iso(max_time_stamp)
            );
        }
        if !self.parent_soql_filter.trim().is_empty() {
            parent_where.push(format!("({})", self.parent_soql_filter));
        }

        let mut query = format!(
            "SELECT {}, (SELECT {} FROM {}{}) FROM {}",
            self.parent_fields().join(", "),
            self.children_fields().join(", "),
            self.children.object_type_plural,
            children_where,
            self.parent.object_type
        );
        if !parent_where.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&parent_where.join(" AND "));
        }
        query
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
        let mut query = format!(
            "SELECT {} FROM {}",
            self.parent.id_field_name, self.parent.object_type
        );
        if !self.parent_soql_filter.trim().is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&self.parent_soql_filter);
        }
        collect_query_ids(ctx.rest, &query, &self.parent.id_field_name).await
    }

    /// Children of a fetched parent record, as returned by the nested query.
    fn children_of(&self, tree: &Value) -> Vec<Value> {
        tree.get(&self.children.object_type_plural)
            .and_then(|c| c.get("records"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    pub(super) fn latest_modification_time_stamp(&self, trees: &[Value]) -> Timestamp {
        let children: Vec<Value> = trees.iter().flat_map(|t| self.children_of(t)).collect();
        latest_modification_time_stamp(trees, &self.parent.modification_date_field_name).max(
            latest_modification_time_stamp(&children, &self.children.modification_date_field_name),
        )
    }

    /// Split record trees into parents and children and save both soups in
    /// one transaction.
    ///
    /// Under leave-if-changed a tree is skipped entirely when its parent or
    /// any of its children is dirty locally.
    pub(super) fn save_record_trees(
        &self,
        ctx: &SyncContext<'_>,
        trees: Vec<Value>,
    ) -> Result<usize> {
        let parent_id_field = self.parent.id_field_name.as_str();
        let child_id_field = self.children.id_field_name.as_str();
        let (dirty_parents, dirty_children) = if ctx.options.merge_mode == MergeMode::LeaveIfChanged
        {
            (
                dirty_record_ids(ctx.store, &self.parent.soup_name, parent_id_field)?,
                dirty_record_ids(ctx.store, &self.children.soup_name, child_id_field)?,
            )
        } else {
            (HashSet::new(), HashSet::new())
        };

        let mut parents = Vec::new();
        let mut children = Vec::new();
        for mut tree in trees {
            let tree_children = self.children_of(&tree);
            let parent_id = record_id(&tree, parent_id_field);
            let skip = parent_id.as_ref().is_some_and(|id| dirty_parents.contains(id))
                || tree_children.iter().any(|c| {
                    record_id(c, child_id_field).is_some_and(|id| dirty_children.contains(&id))
                });
            if skip {
                continue;
            }

            if let Some(map) = tree.as_object_mut() {
                map.remove(&self.children.object_type_plural);
            }
            mark_clean(&mut tree, ctx.sync_id);
            parents.push(tree);

            for mut child in tree_children {
                if let (Some(map), Some(id)) = (child.as_object_mut(), parent_id.as_ref()) {
                    map.insert(
                        self.children.parent_id_field_name.clone(),
                        Value::String(id.clone()),
                    );
                }
                mark_clean(&mut child, ctx.sync_id);
                children.push(child);
            }
        }

        let saved = parents.len();
        let child_count = children.len();
        ctx.store.transaction(|txn| {
            txn.upsert_entries(&self.parent.soup_name, parents, Some(parent_id_field))?;
            txn.upsert_entries(&self.children.soup_name, children, Some(child_id_field))?;
            Ok(())
        })?;
        debug!(
            sync_id = ctx.sync_id,
            soup = %self.parent.soup_name,
            records = saved,
            children = child_count,
            "saved record trees"
        );
        Ok(saved)
    }

    /// Remove ghost parents. Under a master-detail relationship their
    /// children go too.
    pub(super) fn remove_ghosts(
        &self,
        ctx: &SyncContext<'_>,
        remote_ids: &HashSet<String>,
    ) -> Result<usize> {
        let parent_soup = self.parent.soup_name.as_str();
        let ghosts = ghost_ids(ctx, parent_soup, &self.parent.id_field_name, remote_ids)?;
        let parent_entries = entry_ids_for(
            ctx.store,
            parent_soup,
            &self.parent.id_field_name,
            &ghosts,
        )?;
        let child_entries = match self.relationship_type {
            RelationshipType::MasterDetail => entry_ids_for(
                ctx.store,
                &self.children.soup_name,
                &self.children.parent_id_field_name,
                &ghosts,
            )?,
            RelationshipType::Lookup => Vec::new(),
        };

        ctx.store.transaction(|txn| {
            txn.remove_entries(parent_soup, &parent_entries)?;
            txn.remove_entries(&self.children.soup_name, &child_entries)
        })?;
        debug!(
            sync_id = ctx.sync_id,
            soup = parent_soup,
            records = parent_entries.len(),
            children = child_entries.len(),
            "removed ghost record trees"
        );
        Ok(parent_entries.len())
    }
}

fn with_required(fields: &[String], required: &[&String]) -> Vec<String> {
    let mut all: Vec<String> = required.iter().map(|f| f.to_string()).collect();
    for field in fields {
        if !all.iter().any(|f| f.eq_ignore_ascii_case(field)) {
            all.push(field.clone());
        }
    }
    all
}
