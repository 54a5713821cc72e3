//! Cloud account models.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::utils::{new_id, rfc3339_now};

/// Supported cloud connector types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudType {
    AwsCnr,
    AzureCnr,
    KubernetesCnr,
    GcpCnr,
}

impl CloudType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudType::AwsCnr => "aws_cnr",
            CloudType::AzureCnr => "azure_cnr",
            CloudType::KubernetesCnr => "kubernetes_cnr",
            CloudType::GcpCnr => "gcp_cnr",
        }
    }
}

impl std::fmt::Display for CloudType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CloudType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aws_cnr" | "aws" => Ok(CloudType::AwsCnr),
            "azure_cnr" | "azure" => Ok(CloudType::AzureCnr),
            "kubernetes_cnr" | "kubernetes" | "k8s" => Ok(CloudType::KubernetesCnr),
            "gcp_cnr" | "gcp" => Ok(CloudType::GcpCnr),
            _ => Err(format!("Unknown cloud type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CloudAccount {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub cloud_type: String,
    pub created_at: String,
    pub deleted_at: i64,
}

impl CloudAccount {
    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        name: &str,
        cloud_type: CloudType,
    ) -> Result<CloudAccount, sqlx::Error> {
        let account = CloudAccount {
            id: new_id(),
            organization_id: organization_id.to_string(),
            name: name.to_string(),
            cloud_type: cloud_type.as_str().to_string(),
            created_at: rfc3339_now(),
            deleted_at: 0,
        };

        sqlx::query(
            r#"
            INSERT INTO cloud_accounts (id, organization_id, name, cloud_type, created_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&account.id)
        .bind(&account.organization_id)
        .bind(&account.name)
        .bind(&account.cloud_type)
        .bind(&account.created_at)
        .execute(db)
        .await?;

        Ok(account)
    }

    pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<CloudAccount>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM cloud_accounts WHERE id = ? AND deleted_at = 0")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list(db: &SqlitePool, organization_id: &str) -> Result<Vec<CloudAccount>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM cloud_accounts WHERE organization_id = ? AND deleted_at = 0 ORDER BY name ASC",
        )
        .bind(organization_id)
        .fetch_all(db)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization};

    #[test]
    fn test_cloud_type_parsing() {
        assert_eq!("aws".parse::<CloudType>(), Ok(CloudType::AwsCnr));
        assert_eq!("K8S".parse::<CloudType>(), Ok(CloudType::KubernetesCnr));
        assert_eq!("azure_cnr".parse::<CloudType>(), Ok(CloudType::AzureCnr));
        assert!("oracle".parse::<CloudType>().is_err());
        assert_eq!(CloudType::GcpCnr.to_string(), "gcp_cnr");
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "Owner").await.unwrap();
        let account = CloudAccount::create(&db, &org.organization.id, "prod", CloudType::AwsCnr)
            .await
            .unwrap();

        let listed = CloudAccount::list(&db, &org.organization.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, account.id);
        assert_eq!(listed[0].cloud_type.parse::<CloudType>(), Ok(CloudType::AwsCnr));
    }
}
