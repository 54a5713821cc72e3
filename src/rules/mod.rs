//! Assignment rules engine.
//!
//! Decides which pool and owner a resource belongs to. Rules are evaluated
//! in priority order and the first rule whose conditions all match wins.
//! Resources no rule claims fall back to the organization's root pool and
//! its default owner.

mod conditions;

pub use conditions::CompiledCondition;

use thiserror::Error;

use crate::db::{
    AppliedRule, AssignmentRule, CreateAssignmentRule, Employee, Pool, Resource,
};
use crate::DbPool;

#[derive(Error, Debug)]
pub enum RulesError {
    #[error("Invalid {condition_type} condition: {reason}")]
    InvalidCondition {
        condition_type: String,
        reason: String,
    },

    #[error("Organization {0} has no root pool")]
    NoRootPool(String),

    #[error("Pool {0} does not belong to the organization")]
    PoolNotFound(String),

    #[error("Employee {0} does not belong to the organization")]
    OwnerNotFound(String),

    #[error("Assignment rule {0} not found")]
    RuleNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Malformed rule: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Pool and owner chosen for a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub pool_id: String,
    pub employee_id: Option<String>,
    pub applied_rules: Vec<AppliedRule>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: AssignmentRule,
    conditions: Vec<CompiledCondition>,
}

impl CompiledRule {
    fn compile(rule: AssignmentRule) -> Result<Self, RulesError> {
        let conditions = rule
            .conditions
            .iter()
            .map(CompiledCondition::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rule, conditions })
    }

    fn matches(&self, resource: &Resource) -> bool {
        !self.conditions.is_empty() && self.conditions.iter().all(|c| c.matches(resource))
    }
}

/// Rules of one organization, loaded once and evaluated many times
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    fallback: Assignment,
}

impl RuleSet {
    /// Load active rules and the root-pool fallback of an organization
    pub async fn load(db: &DbPool, organization_id: &str) -> Result<Self, RulesError> {
        let root = Pool::root(db, organization_id)
            .await?
            .ok_or_else(|| RulesError::NoRootPool(organization_id.to_string()))?;

        let mut rules = Vec::new();
        for row in AssignmentRule::list(db, organization_id).await? {
            let rule = AssignmentRule::try_from(row)?;
            if !rule.active {
                continue;
            }
            match CompiledRule::compile(rule) {
                Ok(compiled) => rules.push(compiled),
                Err(e) => {
                    // Stored rules were validated on create, skip anything that no longer parses
                    tracing::warn!(organization_id = %organization_id, error = %e, "Skipping unusable assignment rule");
                }
            }
        }

        tracing::debug!(
            organization_id = %organization_id,
            rules = rules.len(),
            "Assignment rules loaded"
        );

        Ok(Self::new(rules, root))
    }

    fn new(rules: Vec<CompiledRule>, root: Pool) -> Self {
        Self {
            rules,
            fallback: Assignment {
                pool_id: root.id,
                employee_id: root.default_owner_id,
                applied_rules: Vec::new(),
            },
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Pick the pool and owner for a resource
    pub fn resolve(&self, resource: &Resource) -> Assignment {
        self.rules
            .iter()
            .find(|compiled| compiled.matches(resource))
            .map(|compiled| Assignment {
                pool_id: compiled.rule.pool_id.clone(),
                employee_id: Some(compiled.rule.owner_id.clone()),
                applied_rules: vec![compiled.rule.applied()],
            })
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Validate and store a new rule at the lowest priority
pub async fn create_rule(
    db: &DbPool,
    organization_id: &str,
    input: CreateAssignmentRule,
) -> Result<AssignmentRule, RulesError> {
    let name = input.name.trim();
    if name.is_empty() || name.len() > 255 {
        return Err(RulesError::Validation(
            "name must be between 1 and 255 characters".to_string(),
        ));
    }
    if input.conditions.is_empty() {
        return Err(RulesError::Validation(
            "at least one condition is required".to_string(),
        ));
    }
    for condition in &input.conditions {
        CompiledCondition::compile(condition)?;
    }

    let pool = Pool::get(db, &input.pool_id).await?;
    if pool.map(|p| p.organization_id) != Some(organization_id.to_string()) {
        return Err(RulesError::PoolNotFound(input.pool_id));
    }
    let owner = Employee::get(db, &input.owner_id).await?;
    if owner.map(|e| e.organization_id) != Some(organization_id.to_string()) {
        return Err(RulesError::OwnerNotFound(input.owner_id));
    }

    let input = CreateAssignmentRule {
        name: name.to_string(),
        ..input
    };
    let rule = AssignmentRule::insert(db, organization_id, &input).await?;

    tracing::info!(
        organization_id = %organization_id,
        rule_id = %rule.id,
        priority = rule.priority,
        "Assignment rule created"
    );

    Ok(rule)
}

pub async fn list_rules(db: &DbPool, organization_id: &str) -> Result<Vec<AssignmentRule>, RulesError> {
    AssignmentRule::list(db, organization_id)
        .await?
        .into_iter()
        .map(|row| AssignmentRule::try_from(row).map_err(RulesError::from))
        .collect()
}

pub async fn delete_rule(db: &DbPool, rule_id: &str) -> Result<(), RulesError> {
    if AssignmentRule::delete(db, rule_id).await? {
        tracing::info!(rule_id = %rule_id, "Assignment rule deleted");
        Ok(())
    } else {
        Err(RulesError::RuleNotFound(rule_id.to_string()))
    }
}
