//! Compiled rule conditions.

use serde::Deserialize;

use super::RulesError;
use crate::db::{Condition, ConditionType, Resource};

#[derive(Debug, Deserialize)]
struct TagMeta {
    key: String,
    value: String,
}

const TAG_META_HINT: &str = "meta_info must be a JSON object with a non-empty key and a value";

fn parse_tag_meta(meta_info: &str) -> Option<(String, String)> {
    let meta: TagMeta = serde_json::from_str(meta_info).ok()?;
    if meta.key.is_empty() {
        return None;
    }
    Some((meta.key, meta.value))
}

/// A condition with its `meta_info` already parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledCondition {
    NameIs(String),
    NameStartsWith(String),
    NameEndsWith(String),
    NameContains(String),
    ResourceTypeIs(String),
    RegionIs(String),
    CloudIs(String),
    TagIs { key: String, value: String },
    TagExists(String),
    TagValueStartsWith { key: String, prefix: String },
}

impl CompiledCondition {
    pub fn compile(condition: &Condition) -> Result<Self, RulesError> {
        let invalid = |reason: &str| RulesError::InvalidCondition {
            condition_type: condition.condition_type.to_string(),
            reason: reason.to_string(),
        };

        if condition.meta_info.is_empty() {
            return Err(invalid("meta_info must not be empty"));
        }

        let meta = condition.meta_info.clone();
        Ok(match condition.condition_type {
            ConditionType::NameIs => CompiledCondition::NameIs(meta),
            ConditionType::NameStartsWith => CompiledCondition::NameStartsWith(meta),
            ConditionType::NameEndsWith => CompiledCondition::NameEndsWith(meta),
            ConditionType::NameContains => CompiledCondition::NameContains(meta),
            ConditionType::ResourceTypeIs => CompiledCondition::ResourceTypeIs(meta),
            ConditionType::RegionIs => CompiledCondition::RegionIs(meta),
            ConditionType::CloudIs => CompiledCondition::CloudIs(meta),
            ConditionType::TagExists => CompiledCondition::TagExists(meta),
            ConditionType::TagIs => {
                let (key, value) = parse_tag_meta(&meta).ok_or_else(|| invalid(TAG_META_HINT))?;
                CompiledCondition::TagIs { key, value }
            }
            ConditionType::TagValueStartsWith => {
                let (key, prefix) = parse_tag_meta(&meta).ok_or_else(|| invalid(TAG_META_HINT))?;
                CompiledCondition::TagValueStartsWith { key, prefix }
            }
        })
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        let name = resource.name.as_deref();
        match self {
            CompiledCondition::NameIs(v) => name == Some(v.as_str()),
            CompiledCondition::NameStartsWith(v) => name.is_some_and(|n| n.starts_with(v.as_str())),
            CompiledCondition::NameEndsWith(v) => name.is_some_and(|n| n.ends_with(v.as_str())),
            CompiledCondition::NameContains(v) => name.is_some_and(|n| n.contains(v.as_str())),
            CompiledCondition::ResourceTypeIs(v) => resource.resource_type == *v,
            CompiledCondition::RegionIs(v) => resource.region.as_deref() == Some(v.as_str()),
            CompiledCondition::CloudIs(v) => resource.cloud_account_id.as_deref() == Some(v.as_str()),
            CompiledCondition::TagIs { key, value } => resource.tags.get(key) == Some(value),
            CompiledCondition::TagExists(key) => resource.tags.contains_key(key),
            CompiledCondition::TagValueStartsWith { key, prefix } => resource
                .tags
                .get(key)
                .is_some_and(|v| v.starts_with(prefix.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::resource::fixtures::{member, with_tags};

    fn compile(condition_type: ConditionType, meta: &str) -> CompiledCondition {
        CompiledCondition::compile(&Condition::new(condition_type, meta)).unwrap()
    }

    #[test]
    fn test_name_conditions() {
        let resource = member("org", "acc", "web-frontend-01");
        assert!(compile(ConditionType::NameIs, "web-frontend-01").matches(&resource));
        assert!(compile(ConditionType::NameStartsWith, "web-").matches(&resource));
        assert!(compile(ConditionType::NameEndsWith, "-01").matches(&resource));
        assert!(compile(ConditionType::NameContains, "front").matches(&resource));
        assert!(!compile(ConditionType::NameContains, "Front").matches(&resource));

        let mut nameless = resource.clone();
        nameless.name = None;
        assert!(!compile(ConditionType::NameStartsWith, "web-").matches(&nameless));
    }

    #[test]
    fn test_tag_conditions() {
        let resource = with_tags(member("org", "acc", "i-1"), &[("env", "prod-eu"), ("team", "core")]);

        let tag_is = CompiledCondition::compile(&Condition::tag(ConditionType::TagIs, "team", "core")).unwrap();
        assert!(tag_is.matches(&resource));

        let starts = CompiledCondition::compile(&Condition::tag(ConditionType::TagValueStartsWith, "env", "prod"))
            .unwrap();
        assert!(starts.matches(&resource));

        assert!(compile(ConditionType::TagExists, "env").matches(&resource));
        assert!(!compile(ConditionType::TagExists, "owner").matches(&resource));
    }

    #[test]
    fn test_cloud_and_region_conditions() {
        let resource = member("org", "acc-1", "i-1");
        assert!(compile(ConditionType::CloudIs, "acc-1").matches(&resource));
        assert!(!compile(ConditionType::CloudIs, "acc-2").matches(&resource));
        assert!(compile(ConditionType::RegionIs, "us-east-1").matches(&resource));
        assert!(compile(ConditionType::ResourceTypeIs, "Instance").matches(&resource));

        let mut cluster = resource.clone();
        cluster.cloud_account_id = None;
        assert!(!compile(ConditionType::CloudIs, "acc-1").matches(&cluster));
    }

    #[test]
    fn test_invalid_meta_info_is_rejected() {
        let err = CompiledCondition::compile(&Condition::new(ConditionType::TagIs, "env=prod")).unwrap_err();
        assert!(matches!(err, RulesError::InvalidCondition { .. }));

        let err = CompiledCondition::compile(&Condition::new(ConditionType::NameIs, "")).unwrap_err();
        assert!(err.to_string().contains("name_is"));

        let empty_key = Condition::tag(ConditionType::TagIs, "", "x");
        assert!(CompiledCondition::compile(&empty_key).is_err());
    }
}
