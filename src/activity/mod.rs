//! Activity publishing side channel.
//!
//! Engine operations report what they did through an [`ActivityPublisher`].
//! Publishing is best effort: a failed publish is logged and never fails the
//! operation that produced the event.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::{ActivityEvent, NewActivityEvent};
use crate::DbPool;

#[async_trait]
pub trait ActivityPublisher: Send + Sync {
    async fn publish(&self, event: NewActivityEvent) -> anyhow::Result<()>;
}

/// Publish and swallow failures
pub async fn publish_quietly(publisher: &dyn ActivityPublisher, event: NewActivityEvent) {
    let action = event.action.clone();
    let organization_id = event.organization_id.clone();
    if let Err(e) = publisher.publish(event).await {
        tracing::warn!(
            error = %e,
            action = %action,
            organization_id = %organization_id,
            "Failed to publish activity event"
        );
    }
}

/// Persists events to the `activity_events` table
pub struct DbActivityPublisher {
    db: DbPool,
}

impl DbActivityPublisher {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub fn shared(db: DbPool) -> Arc<dyn ActivityPublisher> {
        Arc::new(Self::new(db))
    }
}

#[async_trait]
impl ActivityPublisher for DbActivityPublisher {
    async fn publish(&self, event: NewActivityEvent) -> anyhow::Result<()> {
        let stored = ActivityEvent::insert(&self.db, &event).await?;
        tracing::debug!(
            action = %stored.action,
            object_type = %stored.object_type,
            object_id = %stored.object_id,
            level = %stored.level,
            "Activity event recorded"
        );
        Ok(())
    }
}

/// Keeps events in memory, used where no persistence is wanted
#[derive(Default)]
pub struct MemoryActivityPublisher {
    events: Mutex<Vec<NewActivityEvent>>,
}

impl MemoryActivityPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<NewActivityEvent> {
        self.events.lock().await.clone()
    }

    pub async fn actions(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.action.clone())
            .collect()
    }
}

#[async_trait]
impl ActivityPublisher for MemoryActivityPublisher {
    async fn publish(&self, event: NewActivityEvent) -> anyhow::Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}
