//! Assignment rule models.
//!
//! Rules map resources onto a pool and owner. They are evaluated in priority
//! order (1 first); the conditions of one rule are combined with AND.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::utils::{new_id, rfc3339_now, unix_now};

/// Condition kinds understood by the rules engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    NameIs,
    NameStartsWith,
    NameEndsWith,
    NameContains,
    ResourceTypeIs,
    RegionIs,
    CloudIs,
    TagIs,
    TagExists,
    TagValueStartsWith,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::NameIs => "name_is",
            ConditionType::NameStartsWith => "name_starts_with",
            ConditionType::NameEndsWith => "name_ends_with",
            ConditionType::NameContains => "name_contains",
            ConditionType::ResourceTypeIs => "resource_type_is",
            ConditionType::RegionIs => "region_is",
            ConditionType::CloudIs => "cloud_is",
            ConditionType::TagIs => "tag_is",
            ConditionType::TagExists => "tag_exists",
            ConditionType::TagValueStartsWith => "tag_value_starts_with",
        }
    }

    /// Whether `meta_info` carries a `{"key": .., "value": ..}` JSON object
    pub fn takes_key_value(&self) -> bool {
        matches!(self, ConditionType::TagIs | ConditionType::TagValueStartsWith)
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub meta_info: String,
}

impl Condition {
    pub fn new(condition_type: ConditionType, meta_info: impl Into<String>) -> Self {
        Self {
            condition_type,
            meta_info: meta_info.into(),
        }
    }

    /// Build a `tag_is`/`tag_value_starts_with` condition
    pub fn tag(condition_type: ConditionType, key: &str, value: &str) -> Self {
        let meta_info = serde_json::json!({ "key": key, "value": value }).to_string();
        Self {
            condition_type,
            meta_info,
        }
    }
}

/// Record of the rule that assigned a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRule {
    pub id: String,
    pub name: String,
    pub pool_id: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct AssignmentRuleRow {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub active: i64,
    pub priority: i64,
    pub pool_id: String,
    pub owner_id: String,
    pub conditions: String,
    pub created_at: String,
    pub deleted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub active: bool,
    pub priority: i64,
    pub pool_id: String,
    pub owner_id: String,
    pub conditions: Vec<Condition>,
    pub created_at: String,
}

impl TryFrom<AssignmentRuleRow> for AssignmentRule {
    type Error = serde_json::Error;

    fn try_from(row: AssignmentRuleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            conditions: serde_json::from_str(&row.conditions)?,
            id: row.id,
            organization_id: row.organization_id,
            name: row.name,
            active: row.active != 0,
            priority: row.priority,
            pool_id: row.pool_id,
            owner_id: row.owner_id,
            created_at: row.created_at,
        })
    }
}

/// Input for creating a rule
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAssignmentRule {
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub pool_id: String,
    pub owner_id: String,
    pub conditions: Vec<Condition>,
}

fn default_active() -> bool {
    true
}

impl AssignmentRule {
    pub fn applied(&self) -> AppliedRule {
        AppliedRule {
            id: self.id.clone(),
            name: self.name.clone(),
            pool_id: self.pool_id.clone(),
        }
    }

    /// Insert a rule at the lowest priority
    pub async fn insert(
        db: &SqlitePool,
        organization_id: &str,
        input: &CreateAssignmentRule,
    ) -> Result<AssignmentRule, sqlx::Error> {
        let mut tx = db.begin().await?;

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM assignment_rules WHERE organization_id = ? AND deleted_at = 0",
        )
        .bind(organization_id)
        .fetch_one(&mut *tx)
        .await?;

        let rule = AssignmentRule {
            id: new_id(),
            organization_id: organization_id.to_string(),
            name: input.name.clone(),
            active: input.active,
            priority: count + 1,
            pool_id: input.pool_id.clone(),
            owner_id: input.owner_id.clone(),
            conditions: input.conditions.clone(),
            created_at: rfc3339_now(),
        };
        let conditions =
            serde_json::to_string(&rule.conditions).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        sqlx::query(
            r#"
            INSERT INTO assignment_rules (id, organization_id, name, active, priority, pool_id, owner_id, conditions, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.organization_id)
        .bind(&rule.name)
        .bind(rule.active as i64)
        .bind(rule.priority)
        .bind(&rule.pool_id)
        .bind(&rule.owner_id)
        .bind(&conditions)
        .bind(&rule.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rule)
    }

    pub async fn list(db: &SqlitePool, organization_id: &str) -> Result<Vec<AssignmentRuleRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM assignment_rules
            WHERE organization_id = ? AND deleted_at = 0
            ORDER BY priority ASC
            "#,
        )
        .bind(organization_id)
        .fetch_all(db)
        .await
    }

    /// Soft-delete a rule and close the gap it leaves in the priorities
    pub async fn delete(db: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
        let mut tx = db.begin().await?;

        let existing: Option<AssignmentRuleRow> =
            sqlx::query_as("SELECT * FROM assignment_rules WHERE id = ? AND deleted_at = 0")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(existing) = existing else {
            return Ok(false);
        };

        sqlx::query("UPDATE assignment_rules SET deleted_at = ? WHERE id = ?")
            .bind(unix_now())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE assignment_rules SET priority = priority - 1
            WHERE organization_id = ? AND deleted_at = 0 AND priority > ?
            "#,
        )
        .bind(&existing.organization_id)
        .bind(existing.priority)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
