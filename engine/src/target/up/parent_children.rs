use super::crud::{
    apply_response, ids_to_check, plan, record_failure, remote_modification_dates,
    remove_locally, save_locally, Applied, Plan, RecordFields, RemoteDates,
};
use super::SyncUpOutcome;
use crate::sync_state::MergeMode;
use crate::target::composite::{send_composite, send_single, RecordRequest, RecordRequestKind};
use crate::target::down::{ChildrenInfo, ParentInfo, RelationshipType};
use crate::target::{
    dirty_records, entry_id, is_dirty, is_locally_created, is_locally_deleted, record_id,
    records_where, SyncContext,
};
use crate::{error::Result, json_path, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

const PARENT_REFERENCE: &str = "refParent";

/// Pushes a parent record together with its dirty children in one
/// all-or-none composite call.
///
/// Children of a parent created in the same call point at it through a
/// composite reference. Children of a deleted master-detail parent are
/// deleted remotely by the parent delete and removed locally afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentChildrenUpTarget {
    pub parent: ParentInfo,
    pub children: ChildrenInfo,
    pub relationship_type: RelationshipType,
    #[serde(default, rename = "parentCreateFieldlist")]
    pub parent_create_field_list: Vec<String>,
    #[serde(default, rename = "parentUpdateFieldlist")]
    pub parent_update_field_list: Vec<String>,
    #[serde(default, rename = "childrenCreateFieldlist")]
    pub children_create_field_list: Vec<String>,
    #[serde(default, rename = "childrenUpdateFieldlist")]
    pub children_update_field_list: Vec<String>,
}

impl ParentChildrenUpTarget {
    pub fn new(
        parent: ParentInfo,
        children: ChildrenInfo,
        relationship_type: RelationshipType,
    ) -> Self {
        Self {
            parent,
            children,
            relationship_type,
            parent_create_field_list: Vec::new(),
            parent_update_field_list: Vec::new(),
            children_create_field_list: Vec::new(),
            children_update_field_list: Vec::new(),
        }
    }

    pub(super) fn validate(&self) -> Result<()> {
        if self.parent.soup_name == self.children.soup_name {
            return Err(Error::InvalidSyncConfig(
                "parent and children must use different soups".into(),
            ));
        }
        if self.children.parent_id_field_name.trim().is_empty() {
            return Err(Error::InvalidSyncConfig(
                "children parentIdFieldName must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn parent_fields(&self) -> RecordFields<'_> {
        RecordFields {
            object_type: Some(&self.parent.object_type),
            id_field: &self.parent.id_field_name,
            modification_date_field: &self.parent.modification_date_field_name,
            create_fields: &self.parent_create_field_list,
            update_fields: &self.parent_update_field_list,
        }
    }

    fn children_fields(&self) -> RecordFields<'_> {
        RecordFields {
            object_type: Some(&self.children.object_type),
            id_field: &self.children.id_field_name,
            modification_date_field: &self.children.modification_date_field_name,
            create_fields: &self.children_create_field_list,
            update_fields: &self.children_update_field_list,
        }
    }

    /// Dirty parents, plus the parents of dirty children.
    pub(super) fn dirty_records(&self, ctx: &SyncContext<'_>) -> Result<Vec<Value>> {
        let mut parents = dirty_records(ctx.store, &self.parent.soup_name)?;
        let mut seen: HashSet<_> = parents.iter().filter_map(entry_id).collect();
        for child in dirty_records(ctx.store, &self.children.soup_name)? {
            let parent_field = &self.children.parent_id_field_name;
            let Some(parent_id) = json_path::project_str(&child, parent_field) else {
                continue;
            };
            for parent in records_where(
                ctx.store,
                &self.parent.soup_name,
                &self.parent.id_field_name,
                parent_id,
            )? {
                if entry_id(&parent).is_some_and(|id| seen.insert(id)) {
                    parents.push(parent);
                }
            }
        }
        Ok(parents)
    }

    pub(super) async fn sync_up(
        &self,
        ctx: &SyncContext<'_>,
        parents: Vec<Value>,
    ) -> Result<Vec<SyncUpOutcome>> {
        let mut outcomes = Vec::with_capacity(parents.len());
        for parent in parents {
            outcomes.push(self.sync_up_tree(ctx, parent).await?);
        }
        Ok(outcomes)
    }

    fn children_of(&self, ctx: &SyncContext<'_>, parent_id: Option<&str>) -> Result<Vec<Value>> {
        match parent_id {
            Some(id) => records_where(
                ctx.store,
                &self.children.soup_name,
                &self.children.parent_id_field_name,
                id,
            ),
            None => Ok(Vec::new()),
        }
    }

    async fn sync_up_tree(
        &self,
        ctx: &SyncContext<'_>,
        mut parent: Value,
    ) -> Result<SyncUpOutcome> {
        let parent_ctx = ctx.for_soup(&self.parent.soup_name);
        let child_ctx = ctx.for_soup(&self.children.soup_name);
        let parent_fields = self.parent_fields();
        let child_fields = self.children_fields();
        let master_detail = self.relationship_type == RelationshipType::MasterDetail;

        let local_parent_id = record_id(&parent, parent_fields.id_field);
        let mut children = self.children_of(ctx, local_parent_id.as_deref())?;
        // A clean parent is only here for its dirty children and is never written
        let parent_dirty = is_dirty(&parent);
        let parent_created = is_locally_created(&parent);
        let parent_deleted = is_locally_deleted(&parent);

        let remote = if ctx.options.merge_mode == MergeMode::LeaveIfChanged {
            let dirty_children: Vec<Value> =
                children.iter().filter(|c| is_dirty(c)).cloned().collect();
            let parent_ids = if parent_dirty {
                ids_to_check(&parent_fields, std::slice::from_ref(&parent))
            } else {
                Default::default()
            };
            let child_ids = ids_to_check(&child_fields, &dirty_children);
            let lookup = async {
                let mut dates = remote_modification_dates(ctx, &parent_fields, &parent_ids).await?;
                dates.extend(remote_modification_dates(ctx, &child_fields, &child_ids).await?);
                Ok::<_, Error>(dates)
            };
            match lookup.await {
                Ok(dates) => dates,
                Err(Error::Remote(e)) if parent_dirty => {
                    return record_failure(&parent_ctx, &mut parent, &e.to_string());
                }
                Err(Error::Remote(e)) => {
                    return self.fail_children(&child_ctx, &mut children, &e.to_string());
                }
                Err(e) => return Err(e),
            }
        } else {
            RemoteDates::new()
        };

        let parent_request = if parent_dirty {
            match plan(
                &parent_ctx,
                &parent_fields,
                &parent,
                &remote,
                PARENT_REFERENCE.to_string(),
            ) {
                Plan::RemoveLocally => {
                    remove_locally(&parent_ctx, &parent)?;
                    if master_detail {
                        for child in &children {
                            remove_locally(&child_ctx, child)?;
                        }
                    }
                    return Ok(SyncUpOutcome::Applied);
                }
                Plan::Conflict => return Ok(SyncUpOutcome::Conflict),
                Plan::Fail(message) => return record_failure(&parent_ctx, &mut parent, &message),
                Plan::Send(request) => Some(request),
            }
        } else {
            None
        };

        let mut child_requests = Vec::new();
        let mut child_outcome = SyncUpOutcome::Applied;
        if !(parent_deleted && master_detail) {
            for (i, child) in children.iter_mut().enumerate() {
                if !is_dirty(child) {
                    continue;
                }
                match plan(&child_ctx, &child_fields, child, &remote, format!("refChild{}", i)) {
                    Plan::Send(mut request) => {
                        if parent_created && request.kind != RecordRequestKind::Delete {
                            request.fields.insert(
                                self.children.parent_id_field_name.clone(),
                                Value::String(format!("@{{{}.id}}", PARENT_REFERENCE)),
                            );
                        }
                        child_requests.push((i, request));
                    }
                    Plan::RemoveLocally => remove_locally(&child_ctx, child)?,
                    Plan::Conflict => child_outcome = SyncUpOutcome::Conflict,
                    Plan::Fail(message) => {
                        child_outcome = record_failure(&child_ctx, child, &message)?;
                    }
                }
            }
        }

        // A deleted parent goes last so its children are handled first.
        let mut requests: Vec<_> = child_requests.iter().map(|(_, r)| r.clone()).collect();
        match &parent_request {
            Some(request) if parent_deleted => requests.push(request.clone()),
            Some(request) => requests.insert(0, request.clone()),
            None if requests.is_empty() => return Ok(child_outcome),
            None => {}
        }

        let mut responses = match send_composite(ctx.rest, true, &requests).await {
            Ok(responses) => responses,
            Err(e) if parent_dirty => {
                return record_failure(&parent_ctx, &mut parent, &e.to_string())
            }
            Err(e) => return self.fail_children(&child_ctx, &mut children, &e.to_string()),
        };

        let outcome = match &parent_request {
            Some(parent_request) => match responses.remove(PARENT_REFERENCE) {
                Some(response) => {
                    let applied = apply_response(
                        &parent_ctx,
                        &parent_fields,
                        &mut parent,
                        parent_request,
                        &response,
                    )?;
                    match applied {
                        Applied::Done(outcome) => outcome,
                        Applied::Recreate(create) => {
                            self.recreate_parent(&parent_ctx, &parent_fields, &mut parent, create)
                                .await?
                        }
                    }
                }
                None => record_failure(&parent_ctx, &mut parent, "no response for parent")?,
            },
            None => SyncUpOutcome::Applied,
        };

        for (i, request) in &child_requests {
            let child = &mut children[*i];
            let applied = match responses.remove(&request.reference_id) {
                Some(response) => {
                    apply_response(&child_ctx, &child_fields, child, request, &response)?
                }
                None => Applied::Done(record_failure(&child_ctx, child, "no response for child")?),
            };
            if let Applied::Done(SyncUpOutcome::Failed(message)) = applied {
                debug!(sync_id = ctx.sync_id, error = %message, "child record not synced");
                child_outcome = SyncUpOutcome::Failed(message);
            }
        }

        if outcome != SyncUpOutcome::Applied {
            return Ok(outcome);
        }
        if parent_request.is_some() {
            if parent_deleted && master_detail {
                for child in self.children_of(ctx, local_parent_id.as_deref())? {
                    remove_locally(&child_ctx, &child)?;
                }
            } else {
                let server_parent_id = record_id(&parent, parent_fields.id_field);
                if server_parent_id != local_parent_id {
                    if let Some(server_id) = server_parent_id {
                        self.relink_children(&child_ctx, local_parent_id.as_deref(), &server_id)?;
                    }
                }
            }
            return Ok(SyncUpOutcome::Applied);
        }
        Ok(child_outcome)
    }

    /// Record `message` on every dirty child of a tree whose parent is clean.
    fn fail_children(
        &self,
        child_ctx: &SyncContext<'_>,
        children: &mut [Value],
        message: &str,
    ) -> Result<SyncUpOutcome> {
        for child in children.iter_mut().filter(|c| is_dirty(c)) {
            record_failure(child_ctx, child, message)?;
        }
        Ok(SyncUpOutcome::Failed(message.to_string()))
    }

    /// Re-create a parent whose update hit a record deleted remotely.
    async fn recreate_parent(
        &self,
        parent_ctx: &SyncContext<'_>,
        parent_fields: &RecordFields<'_>,
        parent: &mut Value,
        create: RecordRequest,
    ) -> Result<SyncUpOutcome> {
        let response = match send_single(parent_ctx.rest, &create).await {
            Ok(response) => response,
            Err(e) => return record_failure(parent_ctx, parent, &e.to_string()),
        };
        match apply_response(parent_ctx, parent_fields, parent, &create, &response)? {
            Applied::Done(outcome) => Ok(outcome),
            Applied::Recreate(_) => {
                record_failure(parent_ctx, parent, "parent could not be re-created")
            }
        }
    }

    /// Point local children of a newly created parent at its server id.
    fn relink_children(
        &self,
        child_ctx: &SyncContext<'_>,
        local_parent_id: Option<&str>,
        server_id: &str,
    ) -> Result<()> {
        for mut child in self.children_of(child_ctx, local_parent_id)? {
            json_path::set(
                &mut child,
                &self.children.parent_id_field_name,
                Value::String(server_id.to_string()),
            );
            save_locally(child_ctx, &mut child)?;
        }
        Ok(())
    }
}
