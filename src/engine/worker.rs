//! Background reapply worker
//!
//! Periodically reapplies cluster types for every organization that has any,
//! so clusters converge even when changes arrive outside the import path.

use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use super::reapply::{ApplyResult, ClusterApplier};
use super::ClusterError;
use crate::config::ClusteringConfig;
use crate::db::Organization;

/// Organizations reapplied at the same time within one pass
const MAX_CONCURRENT_ORGANIZATIONS: usize = 4;

pub struct ReapplyWorker {
    applier: ClusterApplier,
}

impl ReapplyWorker {
    pub fn new(applier: ClusterApplier) -> Self {
        Self { applier }
    }

    /// Reapply every organization with live cluster types once
    ///
    /// Failures are reported per organization and never abort the pass.
    pub async fn run_once(&self) -> Result<Vec<(String, Result<ApplyResult, ClusterError>)>, ClusterError> {
        let organizations = Organization::list_with_cluster_types(self.applier.db()).await?;

        let mut results: Vec<(String, Result<ApplyResult, ClusterError>)> = stream::iter(organizations)
            .map(|org| async move {
                let result = self.applier.apply(&org.id).await;
                (org.id, result)
            })
            .buffer_unordered(MAX_CONCURRENT_ORGANIZATIONS)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        for (organization_id, result) in &results {
            if let Err(e) = result {
                tracing::warn!(organization_id = %organization_id, error = %e, "Background reapply failed");
            }
        }

        Ok(results)
    }
}

/// Spawn the periodic reapply task
///
/// The applier's organization locks are shared with every other holder of
/// the same applier. Returns `None` when `reapply_interval_secs` is 0.
pub fn spawn_reapply_worker(applier: ClusterApplier, config: &ClusteringConfig) -> Option<JoinHandle<()>> {
    if config.reapply_interval_secs == 0 {
        tracing::info!("Background reapply disabled");
        return None;
    }

    let startup_delay = Duration::from_secs(config.startup_delay_secs);
    let period = Duration::from_secs(config.reapply_interval_secs);
    tracing::info!(
        interval_secs = config.reapply_interval_secs,
        startup_delay_secs = config.startup_delay_secs,
        batch_size = applier.batch_size(),
        "Starting background reapply task"
    );

    let worker = ReapplyWorker::new(applier);

    Some(tokio::spawn(async move {
        tokio::time::sleep(startup_delay).await;

        let mut tick = interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;

            match worker.run_once().await {
                Ok(results) => {
                    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                    tracing::info!(
                        organizations = results.len(),
                        failed = failed,
                        "Background reapply pass completed"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to list organizations for reapply");
                }
            }
        }
    }))
}
