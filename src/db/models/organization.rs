//! Organization, pool and employee models.
//!
//! Every organization owns exactly one root pool (no parent). The root pool's
//! default owner is the fallback assignee for resources no rule claims.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::utils::{new_id, rfc3339_now};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub deleted_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pool {
    pub id: String,
    pub organization_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub default_owner_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Employee {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub created_at: String,
}

/// A freshly created organization with its root pool and owner
#[derive(Debug, Clone, Serialize)]
pub struct OrganizationBundle {
    pub organization: Organization,
    pub root_pool: Pool,
    pub owner: Employee,
}

impl Organization {
    /// Create an organization together with its root pool and default owner
    pub async fn create(
        db: &SqlitePool,
        name: &str,
        owner_name: &str,
    ) -> Result<OrganizationBundle, sqlx::Error> {
        let now = rfc3339_now();
        let organization = Organization {
            id: new_id(),
            name: name.to_string(),
            created_at: now.clone(),
            deleted_at: 0,
        };
        let owner = Employee {
            id: new_id(),
            organization_id: organization.id.clone(),
            name: owner_name.to_string(),
            created_at: now.clone(),
        };
        let root_pool = Pool {
            id: new_id(),
            organization_id: organization.id.clone(),
            parent_id: None,
            name: name.to_string(),
            default_owner_id: Some(owner.id.clone()),
            created_at: now,
        };

        let mut tx = db.begin().await?;

        sqlx::query("INSERT INTO organizations (id, name, created_at, deleted_at) VALUES (?, ?, ?, 0)")
            .bind(&organization.id)
            .bind(&organization.name)
            .bind(&organization.created_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO employees (id, organization_id, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(&owner.id)
            .bind(&owner.organization_id)
            .bind(&owner.name)
            .bind(&owner.created_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO pools (id, organization_id, parent_id, name, default_owner_id, created_at)
            VALUES (?, ?, NULL, ?, ?, ?)
            "#,
        )
        .bind(&root_pool.id)
        .bind(&root_pool.organization_id)
        .bind(&root_pool.name)
        .bind(&root_pool.default_owner_id)
        .bind(&root_pool.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(organization_id = %organization.id, "Organization created");

        Ok(OrganizationBundle {
            organization,
            root_pool,
            owner,
        })
    }

    pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<Organization>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM organizations WHERE id = ? AND deleted_at = 0")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list(db: &SqlitePool) -> Result<Vec<Organization>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM organizations WHERE deleted_at = 0 ORDER BY created_at ASC")
            .fetch_all(db)
            .await
    }

    /// Live organizations that have at least one live cluster type
    pub async fn list_with_cluster_types(db: &SqlitePool) -> Result<Vec<Organization>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT o.* FROM organizations o
            WHERE o.deleted_at = 0
              AND EXISTS (
                SELECT 1 FROM cluster_types ct
                WHERE ct.organization_id = o.id AND ct.deleted_at = 0
              )
            ORDER BY o.created_at ASC
            "#,
        )
        .fetch_all(db)
        .await
    }
}

impl Pool {
    pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<Pool>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM pools WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    /// The organization's root pool (the one without a parent)
    pub async fn root(db: &SqlitePool, organization_id: &str) -> Result<Option<Pool>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM pools WHERE organization_id = ? AND parent_id IS NULL LIMIT 1")
            .bind(organization_id)
            .fetch_optional(db)
            .await
    }

    pub async fn create_child(
        db: &SqlitePool,
        parent: &Pool,
        name: &str,
        default_owner_id: Option<&str>,
    ) -> Result<Pool, sqlx::Error> {
        let pool = Pool {
            id: new_id(),
            organization_id: parent.organization_id.clone(),
            parent_id: Some(parent.id.clone()),
            name: name.to_string(),
            default_owner_id: default_owner_id.map(str::to_string),
            created_at: rfc3339_now(),
        };

        sqlx::query(
            r#"
            INSERT INTO pools (id, organization_id, parent_id, name, default_owner_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&pool.id)
        .bind(&pool.organization_id)
        .bind(&pool.parent_id)
        .bind(&pool.name)
        .bind(&pool.default_owner_id)
        .bind(&pool.created_at)
        .execute(db)
        .await?;

        Ok(pool)
    }
}

impl Employee {
    pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<Employee>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM employees WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        name: &str,
    ) -> Result<Employee, sqlx::Error> {
        let employee = Employee {
            id: new_id(),
            organization_id: organization_id.to_string(),
            name: name.to_string(),
            created_at: rfc3339_now(),
        };

        sqlx::query("INSERT INTO employees (id, organization_id, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(&employee.id)
            .bind(&employee.organization_id)
            .bind(&employee.name)
            .bind(&employee.created_at)
            .execute(db)
            .await?;

        Ok(employee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[tokio::test]
    async fn test_create_organization_with_root_pool() {
        let db = init_memory().await.unwrap();
        let bundle = Organization::create(&db, "Acme", "Jane Roe").await.unwrap();

        let root = Pool::root(&db, &bundle.organization.id).await.unwrap().unwrap();
        assert_eq!(root.id, bundle.root_pool.id);
        assert!(root.parent_id.is_none());
        assert_eq!(root.default_owner_id.as_deref(), Some(bundle.owner.id.as_str()));

        let fetched = Organization::get(&db, &bundle.organization.id).await.unwrap();
        assert_eq!(fetched.unwrap().name, "Acme");
    }

    #[tokio::test]
    async fn test_child_pool_is_not_root() {
        let db = init_memory().await.unwrap();
        let bundle = Organization::create(&db, "Acme", "Jane Roe").await.unwrap();
        let dev = Employee::create(&db, &bundle.organization.id, "Dev").await.unwrap();
        let child = Pool::create_child(&db, &bundle.root_pool, "Dev", Some(&dev.id))
            .await
            .unwrap();

        let root = Pool::root(&db, &bundle.organization.id).await.unwrap().unwrap();
        assert_eq!(root.id, bundle.root_pool.id);
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
    }

    #[tokio::test]
    async fn test_list_with_cluster_types_skips_empty_orgs() {
        let db = init_memory().await.unwrap();
        let with = Organization::create(&db, "With", "A").await.unwrap();
        Organization::create(&db, "Without", "B").await.unwrap();

        sqlx::query(
            "INSERT INTO cluster_types (id, organization_id, name, tag_key, priority, created_at) VALUES ('ct', ?, 'n', 'k', 1, 'now')",
        )
        .bind(&with.organization.id)
        .execute(&db)
        .await
        .unwrap();

        let orgs = Organization::list_with_cluster_types(&db).await.unwrap();
        assert_eq!(orgs.len(), 1);
        assert_eq!(orgs[0].id, with.organization.id);
        assert_eq!(Organization::list(&db).await.unwrap().len(), 2);
    }
}
