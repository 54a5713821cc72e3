//! Discovery batch ingestion.
//!
//! A batch is what one discovery run saw for one cloud account and resource
//! type. Ingestion upserts the documents and then binds everything it touched
//! to clusters with the incremental pass.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::reapply::{ApplyResult, ClusterApplier};
use super::ClusterError;
use crate::activity::publish_quietly;
use crate::db::{actions, object_types, CloudAccount, NewActivityEvent, Resource, ResourceWrite, Tags};
use crate::utils::new_id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub cloud_resource_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryBatch {
    pub cloud_account_id: String,
    pub resource_type: String,
    /// Unix seconds at which the resources were observed
    pub observed_at: i64,
    /// Whether the batch lists every resource of this account and type
    #[serde(default)]
    pub complete: bool,
    pub resources: Vec<DiscoveredResource>,
}

impl DiscoveryBatch {
    fn validate(&self) -> Result<(), ClusterError> {
        if self.resource_type.trim().is_empty() {
            return Err(ClusterError::Validation("resource_type must not be empty".to_string()));
        }
        if self.observed_at < 0 {
            return Err(ClusterError::Validation("observed_at must not be negative".to_string()));
        }
        if self.resources.iter().any(|r| r.cloud_resource_id.trim().is_empty()) {
            return Err(ClusterError::Validation(
                "cloud_resource_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    pub created: usize,
    pub updated: usize,
    pub deactivated: usize,
    pub binding: ApplyResult,
}

/// Merge an observation into a stored document, returning whether it changed
fn merge(stored: &mut Resource, batch: &DiscoveryBatch, seen: &DiscoveredResource) -> bool {
    let before = stored.clone();
    stored.first_seen = stored.first_seen.min(batch.observed_at);
    stored.last_seen = stored.last_seen.max(batch.observed_at);
    // Older observations only widen the lifetime window
    if batch.observed_at >= before.last_seen {
        stored.resource_type = batch.resource_type.clone();
        stored.name = seen.name.clone();
        stored.region = seen.region.clone();
        stored.tags = seen.tags.clone();
        stored.active = true;
    }
    *stored != before
}

fn discovered(account: &CloudAccount, batch: &DiscoveryBatch, seen: DiscoveredResource) -> Resource {
    Resource {
        id: new_id(),
        organization_id: account.organization_id.clone(),
        cloud_account_id: Some(account.id.clone()),
        cloud_resource_id: seen.cloud_resource_id,
        resource_type: batch.resource_type.clone(),
        name: seen.name,
        region: seen.region,
        tags: seen.tags,
        first_seen: batch.observed_at,
        last_seen: batch.observed_at,
        active: true,
        pool_id: None,
        employee_id: None,
        cluster_type_id: None,
        cluster_id: None,
        applied_rules: Vec::new(),
        deleted_at: 0,
    }
}

/// Upserts discovery batches and binds the result to clusters
#[derive(Clone)]
pub struct DiscoveryIngestor {
    applier: ClusterApplier,
}

impl DiscoveryIngestor {
    pub fn new(applier: ClusterApplier) -> Self {
        Self { applier }
    }

    pub async fn ingest(&self, mut batch: DiscoveryBatch) -> Result<IngestResult, ClusterError> {
        batch.validate()?;
        let resources = std::mem::take(&mut batch.resources);

        let db = self.applier.db();
        let account = CloudAccount::get(db, &batch.cloud_account_id)
            .await?
            .ok_or_else(|| ClusterError::not_found("Cloud account", &batch.cloud_account_id))?;
        let organization_id = account.organization_id.clone();

        let _guard = self.applier.locks().lock(&organization_id).await;

        // Later duplicates replace earlier ones
        let mut seen: BTreeMap<String, DiscoveredResource> = BTreeMap::new();
        for resource in resources {
            seen.insert(resource.cloud_resource_id.clone(), resource);
        }

        let mut existing: HashMap<String, Resource> = {
            let mut conn = db.acquire().await?;
            Resource::list_for_account(&mut conn, &account.id)
                .await?
                .into_iter()
                .map(|r| (r.cloud_resource_id.clone(), r))
                .collect()
        };

        let mut result = IngestResult::default();
        let mut writes = Vec::new();
        let mut touched = Vec::with_capacity(seen.len());

        for (cloud_resource_id, observation) in seen {
            match existing.remove(&cloud_resource_id) {
                Some(mut stored) => {
                    if merge(&mut stored, &batch, &observation) {
                        result.updated += 1;
                        touched.push(stored.id.clone());
                        writes.push(ResourceWrite::Replace(stored));
                    } else {
                        touched.push(stored.id);
                    }
                }
                None => {
                    let resource = discovered(&account, &batch, observation);
                    result.created += 1;
                    touched.push(resource.id.clone());
                    writes.push(ResourceWrite::Insert(resource));
                }
            }
        }

        if batch.complete {
            for mut missing in existing.into_values() {
                if missing.resource_type != batch.resource_type
                    || !missing.active
                    || missing.last_seen >= batch.observed_at
                {
                    continue;
                }
                missing.active = false;
                result.deactivated += 1;
                touched.push(missing.id.clone());
                writes.push(ResourceWrite::Replace(missing));
            }
        }

        if !writes.is_empty() {
            Resource::bulk_write(db, writes, self.applier.batch_size()).await?;
        }
        result.binding = self.applier.bind_locked(&organization_id, &touched).await?;

        tracing::info!(
            organization_id = %organization_id,
            cloud_account_id = %account.id,
            resource_type = %batch.resource_type,
            created = result.created,
            updated = result.updated,
            deactivated = result.deactivated,
            clusters_created = result.binding.clusters_created,
            clusters_removed = result.binding.clusters_removed,
            "Discovery batch ingested"
        );

        publish_quietly(
            self.applier.publisher().as_ref(),
            NewActivityEvent::info(
                &organization_id,
                object_types::CLOUD_ACCOUNT,
                &account.id,
                actions::DISCOVERY_BATCH_PROCESSED,
            )
            .with_payload(serde_json::json!({
                "resource_type": batch.resource_type,
                "observed_at": batch.observed_at,
                "complete": batch.complete,
                "result": result,
            })),
        )
        .await;

        Ok(result)
    }
}
