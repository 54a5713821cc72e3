pub mod activity;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod metrics;
pub mod rules;
pub mod utils;

pub use db::DbPool;

use std::sync::Arc;

use activity::{ActivityPublisher, DbActivityPublisher};
use config::Config;
use engine::{ClusterApplier, ClusterTypeController, DiscoveryIngestor};

/// Engine services sharing one database, publisher and set of organization locks
#[derive(Clone)]
pub struct Engine {
    pub db: DbPool,
    pub publisher: Arc<dyn ActivityPublisher>,
    pub cluster_types: ClusterTypeController,
    pub discovery: DiscoveryIngestor,
}

impl Engine {
    pub fn new(config: &Config, db: DbPool) -> Self {
        let publisher = DbActivityPublisher::shared(db.clone());
        Self::with_publisher(config, db, publisher)
    }

    pub fn with_publisher(config: &Config, db: DbPool, publisher: Arc<dyn ActivityPublisher>) -> Self {
        let applier = ClusterApplier::new(
            db.clone(),
            publisher.clone(),
            config.clustering.effective_batch_size(),
        );
        Self {
            db,
            publisher,
            cluster_types: ClusterTypeController::new(applier.clone()),
            discovery: DiscoveryIngestor::new(applier),
        }
    }

    pub fn applier(&self) -> &ClusterApplier {
        self.cluster_types.applier()
    }
}
