//! Cluster-type engine.
//!
//! - `aggregate`: pure resolution of resources to clusters and attribute folding
//! - `reapply`: full and incremental reconciliation of cluster membership
//! - `cluster_types`: cluster type lifecycle and priority management
//! - `discovery`: ingestion of discovery batches followed by incremental binding
//! - `worker`: periodic background reapplication

pub mod aggregate;
pub mod cluster_types;
pub mod discovery;
pub mod reapply;
pub mod worker;

pub use aggregate::{ClusterAggregate, ClusterKey, Resolver};
pub use cluster_types::{ClusterTypeController, PriorityAction};
pub use discovery::{DiscoveredResource, DiscoveryBatch, DiscoveryIngestor, IngestResult};
pub use reapply::{ApplyResult, ClusterApplier};
pub use worker::{spawn_reapply_worker, ReapplyWorker};

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::ResourceStoreError;
use crate::rules::RulesError;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rules engine error: {0}")]
    Rules(#[from] RulesError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Malformed document: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<ResourceStoreError> for ClusterError {
    fn from(err: ResourceStoreError) -> Self {
        match err {
            ResourceStoreError::Database(e) => ClusterError::Database(e),
            ResourceStoreError::Malformed(e) => ClusterError::Serialization(e),
        }
    }
}

/// Per-organization async locks
///
/// Every operation that reads and rewrites an organization's clusters or
/// cluster type priorities holds that organization's lock.
#[derive(Clone, Default)]
pub struct OrgLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl OrgLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, organization_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(organization_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_org_locks_are_per_organization() {
        use std::time::Duration;
        use tokio::time::timeout;

        let locks = OrgLocks::new();
        let guard = locks.lock("org-a").await;
        assert!(timeout(Duration::from_millis(20), locks.lock("org-a")).await.is_err());
        assert!(timeout(Duration::from_millis(20), locks.lock("org-b")).await.is_ok());
        drop(guard);
        assert!(timeout(Duration::from_millis(20), locks.lock("org-a")).await.is_ok());
    }

    #[test]
    fn test_store_errors_convert() {
        let err: ClusterError = ResourceStoreError::Database(sqlx::Error::RowNotFound).into();
        assert!(matches!(err, ClusterError::Database(_)));
        assert_eq!(
            ClusterError::not_found("Cluster type", "ct-1").to_string(),
            "Cluster type ct-1 not found"
        );
    }
}
