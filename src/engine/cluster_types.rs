//! Cluster type lifecycle and priority management

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::reapply::{ApplyResult, ClusterApplier};
use super::ClusterError;
use crate::activity::publish_quietly;
use crate::db::{actions, object_types, ClusterType, NewActivityEvent, Organization};
use crate::utils::{new_id, rfc3339_now, unix_now};

const MAX_FIELD_LEN: usize = 255;

/// How to move a cluster type in the priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityAction {
    /// Move to the top
    Prioritize,
    /// Move up one place
    Promote,
    /// Move down one place
    Demote,
    /// Move to the bottom
    Deprioritize,
}

impl FromStr for PriorityAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prioritize" => Ok(PriorityAction::Prioritize),
            "promote" => Ok(PriorityAction::Promote),
            "demote" => Ok(PriorityAction::Demote),
            "deprioritize" => Ok(PriorityAction::Deprioritize),
            other => Err(format!(
                "unknown priority action '{}', expected prioritize, promote, demote or deprioritize",
                other
            )),
        }
    }
}

/// Move the type at `index` and return the new order
fn reorder(mut types: Vec<ClusterType>, index: usize, action: PriorityAction) -> Vec<ClusterType> {
    let last = types.len().saturating_sub(1);
    let target = match action {
        PriorityAction::Prioritize => 0,
        PriorityAction::Promote => index.saturating_sub(1),
        PriorityAction::Demote => (index + 1).min(last),
        PriorityAction::Deprioritize => last,
    };
    let moved = types.remove(index);
    types.insert(target, moved);
    types
}

fn validate_field(field: &str, value: &str) -> Result<String, ClusterError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ClusterError::Validation(format!("{} must not be empty", field)));
    }
    if trimmed.chars().count() > MAX_FIELD_LEN {
        return Err(ClusterError::Validation(format!(
            "{} must be at most {} characters",
            field, MAX_FIELD_LEN
        )));
    }
    Ok(trimmed.to_string())
}

/// Creates, reorders and deletes cluster types, reapplying where needed
#[derive(Clone)]
pub struct ClusterTypeController {
    applier: ClusterApplier,
}

impl ClusterTypeController {
    pub fn new(applier: ClusterApplier) -> Self {
        Self { applier }
    }

    pub fn applier(&self) -> &ClusterApplier {
        &self.applier
    }

    pub async fn create(
        &self,
        organization_id: &str,
        name: &str,
        tag_key: &str,
    ) -> Result<ClusterType, ClusterError> {
        let name = validate_field("name", name)?;
        let tag_key = validate_field("tag_key", tag_key)?;

        let db = self.applier.db();
        Organization::get(db, organization_id)
            .await?
            .ok_or_else(|| ClusterError::not_found("Organization", organization_id))?;

        let _guard = self.applier.locks().lock(organization_id).await;
        let mut tx = db.begin().await?;

        if ClusterType::find_by_name(&mut *tx, organization_id, &name).await?.is_some() {
            return Err(ClusterError::Conflict(format!(
                "Cluster type with name '{}' already exists",
                name
            )));
        }

        let cluster_type = ClusterType {
            id: new_id(),
            organization_id: organization_id.to_string(),
            name,
            tag_key,
            priority: ClusterType::count_live(&mut *tx, organization_id).await? + 1,
            created_at: rfc3339_now(),
            deleted_at: 0,
        };
        ClusterType::insert(&mut *tx, &cluster_type).await?;
        tx.commit().await?;

        tracing::info!(
            organization_id = %organization_id,
            cluster_type_id = %cluster_type.id,
            tag_key = %cluster_type.tag_key,
            priority = cluster_type.priority,
            "Cluster type created"
        );

        publish_quietly(
            self.applier.publisher().as_ref(),
            NewActivityEvent::info(
                organization_id,
                object_types::CLUSTER_TYPE,
                &cluster_type.id,
                actions::CLUSTER_TYPE_CREATED,
            )
            .with_payload(serde_json::json!({
                "name": cluster_type.name,
                "tag_key": cluster_type.tag_key,
                "priority": cluster_type.priority,
            })),
        )
        .await;

        Ok(cluster_type)
    }

    pub async fn get(&self, id: &str) -> Result<ClusterType, ClusterError> {
        ClusterType::get(self.applier.db(), id)
            .await?
            .ok_or_else(|| ClusterError::not_found("Cluster type", id))
    }

    pub async fn list(&self, organization_id: &str) -> Result<Vec<ClusterType>, ClusterError> {
        Ok(ClusterType::list(self.applier.db(), organization_id).await?)
    }

    /// Move a type within its organization's priority order
    pub async fn update_priority(
        &self,
        id: &str,
        action: PriorityAction,
    ) -> Result<Vec<ClusterType>, ClusterError> {
        let target = self.get(id).await?;
        let organization_id = target.organization_id.clone();

        let _guard = self.applier.locks().lock(&organization_id).await;
        let mut tx = self.applier.db().begin().await?;

        let current = ClusterType::list_in(&mut *tx, &organization_id).await?;
        let index = current
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| ClusterError::not_found("Cluster type", id))?;
        let before: Vec<String> = current.iter().map(|t| t.id.clone()).collect();

        let mut reordered = reorder(current, index, action);
        let mut changed = 0;
        for (position, cluster_type) in reordered.iter_mut().enumerate() {
            let priority = position as i64 + 1;
            if cluster_type.priority != priority {
                ClusterType::set_priority(&mut *tx, &cluster_type.id, priority).await?;
                cluster_type.priority = priority;
                changed += 1;
            }
        }
        tx.commit().await?;

        let order_changed = reordered.iter().map(|t| &t.id).ne(before.iter());
        if order_changed {
            tracing::info!(
                organization_id = %organization_id,
                cluster_type_id = %id,
                action = ?action,
                updated = changed,
                "Cluster type priorities changed"
            );
            publish_quietly(
                self.applier.publisher().as_ref(),
                NewActivityEvent::info(
                    &organization_id,
                    object_types::ORGANIZATION,
                    &organization_id,
                    actions::CLUSTER_TYPES_PRIORITY_CHANGED,
                )
                .with_payload(serde_json::json!({
                    "cluster_type_id": id,
                    "action": action,
                    "order": reordered.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
                })),
            )
            .await;
        }

        Ok(reordered)
    }

    /// Soft-delete a type and reapply its organization
    pub async fn delete(&self, id: &str) -> Result<ApplyResult, ClusterError> {
        let target = self.get(id).await?;
        let organization_id = target.organization_id.clone();

        let _guard = self.applier.locks().lock(&organization_id).await;
        let mut tx = self.applier.db().begin().await?;
        ClusterType::mark_deleted(&mut *tx, id, unix_now()).await?;
        for (position, cluster_type) in ClusterType::list_in(&mut *tx, &organization_id)
            .await?
            .iter()
            .enumerate()
        {
            let priority = position as i64 + 1;
            if cluster_type.priority != priority {
                ClusterType::set_priority(&mut *tx, &cluster_type.id, priority).await?;
            }
        }
        tx.commit().await?;

        tracing::info!(
            organization_id = %organization_id,
            cluster_type_id = %id,
            "Cluster type deleted"
        );

        publish_quietly(
            self.applier.publisher().as_ref(),
            NewActivityEvent::info(
                &organization_id,
                object_types::CLUSTER_TYPE,
                id,
                actions::CLUSTER_TYPE_DELETED,
            )
            .with_payload(serde_json::json!({
                "name": target.name,
                "tag_key": target.tag_key,
            })),
        )
        .await;

        self.applier.apply_locked(&organization_id).await
    }

    /// Reapply every cluster type of an organization
    pub async fn apply(&self, organization_id: &str) -> Result<ApplyResult, ClusterError> {
        self.applier.apply(organization_id).await
    }
}
