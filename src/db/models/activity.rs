//! Activity event log models.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityLevel {
    Info,
    Warning,
    Error,
}

impl ActivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLevel::Info => "INFO",
            ActivityLevel::Warning => "WARNING",
            ActivityLevel::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored activity event
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityEvent {
    pub id: String,
    pub organization_id: String,
    pub object_type: String,
    pub object_id: String,
    pub action: String,
    pub level: String,
    pub payload: Option<String>,
    pub created_at: String,
}

/// Event about to be published
#[derive(Debug, Clone, Serialize)]
pub struct NewActivityEvent {
    pub organization_id: String,
    pub object_type: String,
    pub object_id: String,
    pub action: String,
    pub level: ActivityLevel,
    pub payload: Option<serde_json::Value>,
}

impl NewActivityEvent {
    pub fn info(
        organization_id: &str,
        object_type: &str,
        object_id: &str,
        action: &str,
    ) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            action: action.to_string(),
            level: ActivityLevel::Info,
            payload: None,
        }
    }

    pub fn with_level(mut self, level: ActivityLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Activity action names
pub mod actions {
    pub const CLUSTER_TYPE_CREATED: &str = "cluster_type_created";
    pub const CLUSTER_TYPE_DELETED: &str = "cluster_type_deleted";
    pub const CLUSTER_TYPES_PRIORITY_CHANGED: &str = "cluster_types_priority_changed";
    pub const CLUSTER_TYPES_PROCESSING_STARTED: &str = "cluster_types_processing_started";
    pub const CLUSTER_TYPES_PROCESSING_DONE: &str = "cluster_types_processing_done";
    pub const CLUSTER_TYPES_PROCESSING_FAILED: &str = "cluster_types_processing_failed";
    pub const DISCOVERY_BATCH_PROCESSED: &str = "discovery_batch_processed";
}

/// Activity object types
pub mod object_types {
    pub const ORGANIZATION: &str = "organization";
    pub const CLUSTER_TYPE: &str = "cluster_type";
    pub const CLOUD_ACCOUNT: &str = "cloud_account";
}

impl ActivityEvent {
    pub async fn insert(db: &SqlitePool, event: &NewActivityEvent) -> Result<ActivityEvent, sqlx::Error> {
        let stored = ActivityEvent {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: event.organization_id.clone(),
            object_type: event.object_type.clone(),
            object_id: event.object_id.clone(),
            action: event.action.clone(),
            level: event.level.as_str().to_string(),
            payload: event.payload.as_ref().map(|p| p.to_string()),
            created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        };

        sqlx::query(
            r#"
            INSERT INTO activity_events (id, organization_id, object_type, object_id, action, level, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stored.id)
        .bind(&stored.organization_id)
        .bind(&stored.object_type)
        .bind(&stored.object_id)
        .bind(&stored.action)
        .bind(&stored.level)
        .bind(&stored.payload)
        .bind(&stored.created_at)
        .execute(db)
        .await?;

        Ok(stored)
    }

    /// Most recent events of an organization, newest first
    pub async fn list(
        db: &SqlitePool,
        organization_id: &str,
        limit: i64,
    ) -> Result<Vec<ActivityEvent>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM activity_events
            WHERE organization_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(organization_id)
        .bind(limit.clamp(1, 1000))
        .fetch_all(db)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[tokio::test]
    async fn test_insert_and_list_newest_first() {
        let db = init_memory().await.unwrap();
        for action in [actions::CLUSTER_TYPES_PROCESSING_STARTED, actions::CLUSTER_TYPES_PROCESSING_DONE] {
            let event = NewActivityEvent::info("org", object_types::ORGANIZATION, "org", action)
                .with_payload(serde_json::json!({ "action": action }));
            ActivityEvent::insert(&db, &event).await.unwrap();
        }

        let events = ActivityEvent::list(&db, "org", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, actions::CLUSTER_TYPES_PROCESSING_DONE);
        assert_eq!(events[0].level, "INFO");
        let payload: serde_json::Value = serde_json::from_str(events[0].payload.as_deref().unwrap()).unwrap();
        assert_eq!(payload["action"], actions::CLUSTER_TYPES_PROCESSING_DONE);
        assert!(ActivityEvent::list(&db, "other", 10).await.unwrap().is_empty());
    }
}
