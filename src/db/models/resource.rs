//! Resource documents.
//!
//! Both discovered cloud resources ("members") and the synthetic clusters
//! built from them live in the `resources` table. Tags and applied rules are
//! stored as JSON text, the rest of the document is plain columns.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;

use super::AppliedRule;

pub type Tags = BTreeMap<String, String>;

/// Raw row as stored in SQLite
#[derive(Debug, Clone, FromRow)]
pub struct ResourceRow {
    pub id: String,
    pub organization_id: String,
    pub cloud_account_id: Option<String>,
    pub cloud_resource_id: String,
    pub resource_type: String,
    pub name: Option<String>,
    pub region: Option<String>,
    pub tags: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub active: i64,
    pub pool_id: Option<String>,
    pub employee_id: Option<String>,
    pub cluster_type_id: Option<String>,
    pub cluster_id: Option<String>,
    pub applied_rules: String,
    pub deleted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub organization_id: String,
    pub cloud_account_id: Option<String>,
    pub cloud_resource_id: String,
    pub resource_type: String,
    pub name: Option<String>,
    pub region: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    pub first_seen: i64,
    pub last_seen: i64,
    pub active: bool,
    pub pool_id: Option<String>,
    pub employee_id: Option<String>,
    pub cluster_type_id: Option<String>,
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub applied_rules: Vec<AppliedRule>,
    pub deleted_at: i64,
}

impl TryFrom<ResourceRow> for Resource {
    type Error = serde_json::Error;

    fn try_from(row: ResourceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            tags: serde_json::from_str(&row.tags)?,
            applied_rules: serde_json::from_str(&row.applied_rules)?,
            id: row.id,
            organization_id: row.organization_id,
            cloud_account_id: row.cloud_account_id,
            cloud_resource_id: row.cloud_resource_id,
            resource_type: row.resource_type,
            name: row.name,
            region: row.region,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            active: row.active != 0,
            pool_id: row.pool_id,
            employee_id: row.employee_id,
            cluster_type_id: row.cluster_type_id,
            cluster_id: row.cluster_id,
            deleted_at: row.deleted_at,
        })
    }
}

/// Errors raised while loading resource documents
#[derive(Debug, thiserror::Error)]
pub enum ResourceStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("malformed resource document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A single write in a bulk batch
#[derive(Debug, Clone)]
pub enum ResourceWrite {
    Insert(Resource),
    /// Replace every mutable field of the document
    Replace(Resource),
    /// Soft-delete a document
    Remove { id: String, deleted_at: i64 },
}

fn decode_rows(rows: Vec<ResourceRow>) -> Result<Vec<Resource>, ResourceStoreError> {
    rows.into_iter()
        .map(|row| Resource::try_from(row).map_err(ResourceStoreError::from))
        .collect()
}

fn ids_json(ids: &[String]) -> Result<String, serde_json::Error> {
    serde_json::to_string(ids)
}

impl Resource {
    pub fn is_cluster(&self) -> bool {
        self.cluster_type_id.is_some()
    }

    pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<Resource>, ResourceStoreError> {
        let row: Option<ResourceRow> =
            sqlx::query_as("SELECT * FROM resources WHERE id = ? AND deleted_at = 0")
                .bind(id)
                .fetch_optional(db)
                .await?;
        Ok(row.map(Resource::try_from).transpose()?)
    }

    /// Live discovered resources of an organization (clusters excluded)
    pub async fn list_members(
        conn: &mut SqliteConnection,
        organization_id: &str,
    ) -> Result<Vec<Resource>, ResourceStoreError> {
        let rows: Vec<ResourceRow> = sqlx::query_as(
            r#"
            SELECT * FROM resources
            WHERE organization_id = ? AND deleted_at = 0 AND cluster_type_id IS NULL
            ORDER BY cloud_resource_id ASC
            "#,
        )
        .bind(organization_id)
        .fetch_all(conn)
        .await?;
        decode_rows(rows)
    }

    /// Live cluster resources of an organization
    pub async fn list_clusters(
        conn: &mut SqliteConnection,
        organization_id: &str,
    ) -> Result<Vec<Resource>, ResourceStoreError> {
        let rows: Vec<ResourceRow> = sqlx::query_as(
            r#"
            SELECT * FROM resources
            WHERE organization_id = ? AND deleted_at = 0 AND cluster_type_id IS NOT NULL
            ORDER BY cloud_resource_id ASC
            "#,
        )
        .bind(organization_id)
        .fetch_all(conn)
        .await?;
        decode_rows(rows)
    }

    /// Live documents with the given ids
    pub async fn list_by_ids(
        conn: &mut SqliteConnection,
        ids: &[String],
    ) -> Result<Vec<Resource>, ResourceStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<ResourceRow> = sqlx::query_as(
            r#"
            SELECT * FROM resources
            WHERE deleted_at = 0 AND id IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(ids_json(ids)?)
        .fetch_all(conn)
        .await?;
        decode_rows(rows)
    }

    /// Live members currently bound to any of the given clusters
    pub async fn list_bound_to(
        conn: &mut SqliteConnection,
        cluster_ids: &[String],
    ) -> Result<Vec<Resource>, ResourceStoreError> {
        if cluster_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<ResourceRow> = sqlx::query_as(
            r#"
            SELECT * FROM resources
            WHERE deleted_at = 0 AND cluster_id IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(ids_json(cluster_ids)?)
        .fetch_all(conn)
        .await?;
        decode_rows(rows)
    }

    /// Live cluster documents matching the given `cloud_resource_id`s
    pub async fn list_clusters_by_cloud_ids(
        conn: &mut SqliteConnection,
        organization_id: &str,
        cloud_resource_ids: &[String],
    ) -> Result<Vec<Resource>, ResourceStoreError> {
        if cloud_resource_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<ResourceRow> = sqlx::query_as(
            r#"
            SELECT * FROM resources
            WHERE organization_id = ? AND deleted_at = 0 AND cluster_type_id IS NOT NULL
              AND cloud_resource_id IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(organization_id)
        .bind(ids_json(cloud_resource_ids)?)
        .fetch_all(conn)
        .await?;
        decode_rows(rows)
    }

    /// Live members discovered through one cloud account
    pub async fn list_for_account(
        conn: &mut SqliteConnection,
        cloud_account_id: &str,
    ) -> Result<Vec<Resource>, ResourceStoreError> {
        let rows: Vec<ResourceRow> = sqlx::query_as(
            r#"
            SELECT * FROM resources
            WHERE cloud_account_id = ? AND deleted_at = 0
            "#,
        )
        .bind(cloud_account_id)
        .fetch_all(conn)
        .await?;
        decode_rows(rows)
    }

    pub async fn insert(conn: &mut SqliteConnection, resource: &Resource) -> Result<(), ResourceStoreError> {
        sqlx::query(
            r#"
            INSERT INTO resources (
                id, organization_id, cloud_account_id, cloud_resource_id, resource_type,
                name, region, tags, first_seen, last_seen, active, pool_id, employee_id,
                cluster_type_id, cluster_id, applied_rules, deleted_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&resource.id)
        .bind(&resource.organization_id)
        .bind(&resource.cloud_account_id)
        .bind(&resource.cloud_resource_id)
        .bind(&resource.resource_type)
        .bind(&resource.name)
        .bind(&resource.region)
        .bind(serde_json::to_string(&resource.tags)?)
        .bind(resource.first_seen)
        .bind(resource.last_seen)
        .bind(resource.active as i64)
        .bind(&resource.pool_id)
        .bind(&resource.employee_id)
        .bind(&resource.cluster_type_id)
        .bind(&resource.cluster_id)
        .bind(serde_json::to_string(&resource.applied_rules)?)
        .bind(resource.deleted_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn replace(conn: &mut SqliteConnection, resource: &Resource) -> Result<(), ResourceStoreError> {
        sqlx::query(
            r#"
            UPDATE resources SET
                resource_type = ?, name = ?, region = ?, tags = ?, first_seen = ?, last_seen = ?, active = ?,
                pool_id = ?, employee_id = ?, cluster_id = ?, applied_rules = ?
            WHERE id = ? AND deleted_at = 0
            "#,
        )
        .bind(&resource.resource_type)
        .bind(&resource.name)
        .bind(&resource.region)
        .bind(serde_json::to_string(&resource.tags)?)
        .bind(resource.first_seen)
        .bind(resource.last_seen)
        .bind(resource.active as i64)
        .bind(&resource.pool_id)
        .bind(&resource.employee_id)
        .bind(&resource.cluster_id)
        .bind(serde_json::to_string(&resource.applied_rules)?)
        .bind(&resource.id)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn mark_deleted(
        conn: &mut SqliteConnection,
        id: &str,
        deleted_at: i64,
    ) -> Result<(), ResourceStoreError> {
        sqlx::query("UPDATE resources SET deleted_at = ? WHERE id = ? AND deleted_at = 0")
            .bind(deleted_at)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Apply writes in chunks, one transaction per chunk
    ///
    /// Returns the number of writes applied.
    pub async fn bulk_write(
        db: &SqlitePool,
        writes: Vec<ResourceWrite>,
        batch_size: usize,
    ) -> Result<usize, ResourceStoreError> {
        let total = writes.len();
        let batch_size = batch_size.max(1);

        for chunk in writes.chunks(batch_size) {
            let mut tx = db.begin().await?;
            for write in chunk {
                match write {
                    ResourceWrite::Insert(resource) => Self::insert(&mut *tx, resource).await?,
                    ResourceWrite::Replace(resource) => Self::replace(&mut *tx, resource).await?,
                    ResourceWrite::Remove { id, deleted_at } => {
                        Self::mark_deleted(&mut *tx, id, *deleted_at).await?
                    }
                }
            }
            tx.commit().await?;
            tracing::trace!(writes = chunk.len(), "Resource batch committed");
        }

        Ok(total)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::db::{init_memory, CloudAccount, CloudType, Organization};

    async fn setup() -> (SqlitePool, String, String) {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "Owner").await.unwrap();
        let account = CloudAccount::create(&db, &org.organization.id, "aws", CloudType::AwsCnr)
            .await
            .unwrap();
        (db, org.organization.id, account.id)
    }

    #[tokio::test]
    async fn test_insert_and_get_preserves_document() {
        let (db, org_id, account_id) = setup().await;
        let resource = with_tags(member(&org_id, &account_id, "i-1"), &[("env", "prod"), ("team", "")]);

        let mut conn = db.acquire().await.unwrap();
        Resource::insert(&mut conn, &resource).await.unwrap();
        drop(conn);

        let fetched = Resource::get(&db, &resource.id).await.unwrap().unwrap();
        assert_eq!(fetched, resource);
        assert!(!fetched.is_cluster());
    }

    #[tokio::test]
    async fn test_bulk_write_chunks_and_soft_deletes() {
        let (db, org_id, account_id) = setup().await;
        let resources: Vec<Resource> = (0..7)
            .map(|i| member(&org_id, &account_id, &format!("i-{}", i)))
            .collect();

        let writes = resources.iter().cloned().map(ResourceWrite::Insert).collect();
        assert_eq!(Resource::bulk_write(&db, writes, 3).await.unwrap(), 7);

        let mut updated = resources[0].clone();
        updated.active = false;
        updated.tags.insert("env".to_string(), "dev".to_string());
        let writes = vec![
            ResourceWrite::Replace(updated.clone()),
            ResourceWrite::Remove {
                id: resources[1].id.clone(),
                deleted_at: 5_000,
            },
        ];
        Resource::bulk_write(&db, writes, 1).await.unwrap();

        let mut conn = db.acquire().await.unwrap();
        let members = Resource::list_members(&mut conn, &org_id).await.unwrap();
        assert_eq!(members.len(), 6);
        let fetched = members.iter().find(|r| r.id == updated.id).unwrap();
        assert!(!fetched.active);
        assert_eq!(fetched.tags.get("env").map(String::as_str), Some("dev"));
    }

    #[tokio::test]
    async fn test_member_identity_is_unique_among_live_documents() {
        let (db, org_id, account_id) = setup().await;
        let first = member(&org_id, &account_id, "i-dup");
        let second = member(&org_id, &account_id, "i-dup");

        let mut conn = db.acquire().await.unwrap();
        Resource::insert(&mut conn, &first).await.unwrap();
        assert!(Resource::insert(&mut conn, &second).await.is_err());

        Resource::mark_deleted(&mut conn, &first.id, 10).await.unwrap();
        Resource::insert(&mut conn, &second).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_ids_and_bound_members() {
        let (db, org_id, account_id) = setup().await;
        let mut a = member(&org_id, &account_id, "i-a");
        let b = member(&org_id, &account_id, "i-b");
        a.cluster_id = Some("cluster-1".to_string());

        let mut conn = db.acquire().await.unwrap();
        Resource::insert(&mut conn, &a).await.unwrap();
        Resource::insert(&mut conn, &b).await.unwrap();

        let found = Resource::list_by_ids(&mut conn, &[a.id.clone(), b.id.clone(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        let bound = Resource::list_bound_to(&mut conn, &["cluster-1".to_string()])
            .await
            .unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].id, a.id);

        assert!(Resource::list_by_ids(&mut conn, &[]).await.unwrap().is_empty());
    }
}
