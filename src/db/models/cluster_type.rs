//! Cluster type models.
//!
//! A cluster type groups every resource carrying its tag key into one
//! synthetic cluster resource per tag value. Live types of an organization
//! hold the priorities 1..=n, 1 being evaluated first.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ClusterType {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub tag_key: String,
    pub priority: i64,
    pub created_at: String,
    pub deleted_at: i64,
}

impl ClusterType {
    /// `cloud_resource_id` of the cluster this type forms for a tag value
    pub fn cluster_cloud_resource_id(&self, tag_value: &str) -> String {
        format!("{}:{}", self.tag_key, tag_value)
    }

    pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<ClusterType>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM cluster_types WHERE id = ? AND deleted_at = 0")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    /// Live types of an organization, highest priority first
    pub async fn list(db: &SqlitePool, organization_id: &str) -> Result<Vec<ClusterType>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM cluster_types
            WHERE organization_id = ? AND deleted_at = 0
            ORDER BY priority ASC, created_at ASC
            "#,
        )
        .bind(organization_id)
        .fetch_all(db)
        .await
    }

    pub async fn list_in(
        conn: &mut SqliteConnection,
        organization_id: &str,
    ) -> Result<Vec<ClusterType>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM cluster_types
            WHERE organization_id = ? AND deleted_at = 0
            ORDER BY priority ASC, created_at ASC
            "#,
        )
        .bind(organization_id)
        .fetch_all(conn)
        .await
    }

    pub async fn find_by_name(
        conn: &mut SqliteConnection,
        organization_id: &str,
        name: &str,
    ) -> Result<Option<ClusterType>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM cluster_types WHERE organization_id = ? AND name = ? AND deleted_at = 0",
        )
        .bind(organization_id)
        .bind(name)
        .fetch_optional(conn)
        .await
    }

    pub async fn count_live(
        conn: &mut SqliteConnection,
        organization_id: &str,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM cluster_types WHERE organization_id = ? AND deleted_at = 0",
        )
        .bind(organization_id)
        .fetch_one(conn)
        .await
    }

    pub async fn insert(conn: &mut SqliteConnection, cluster_type: &ClusterType) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO cluster_types (id, organization_id, name, tag_key, priority, created_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cluster_type.id)
        .bind(&cluster_type.organization_id)
        .bind(&cluster_type.name)
        .bind(&cluster_type.tag_key)
        .bind(cluster_type.priority)
        .bind(&cluster_type.created_at)
        .bind(cluster_type.deleted_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn set_priority(
        conn: &mut SqliteConnection,
        id: &str,
        priority: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE cluster_types SET priority = ? WHERE id = ?")
            .bind(priority)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn mark_deleted(
        conn: &mut SqliteConnection,
        id: &str,
        deleted_at: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE cluster_types SET deleted_at = ? WHERE id = ? AND deleted_at = 0")
            .bind(deleted_at)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }
}
