//! Cluster resolution and attribute aggregation.
//!
//! Everything here is pure: the same members always produce the same
//! cluster, whatever order they arrive in. That is what makes repeated
//! reapplication a no-op when nothing changed.

use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

use crate::db::{ClusterType, Resource, Tags};
use crate::utils::new_id;

/// Identity of a cluster: its type plus the `cloud_resource_id` derived from the tag value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub cluster_type_id: String,
    pub cloud_resource_id: String,
}

impl ClusterKey {
    pub fn of_cluster(cluster: &Resource) -> Option<Self> {
        Some(Self {
            cluster_type_id: cluster.cluster_type_id.clone()?,
            cloud_resource_id: cluster.cloud_resource_id.clone(),
        })
    }
}

/// Where a member resource wants to live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution<'a> {
    pub cluster_type: &'a ClusterType,
    pub tag_value: String,
}

impl Resolution<'_> {
    pub fn key(&self) -> ClusterKey {
        ClusterKey {
            cluster_type_id: self.cluster_type.id.clone(),
            cloud_resource_id: self.cluster_type.cluster_cloud_resource_id(&self.tag_value),
        }
    }
}

/// Matches member resources against live cluster types in priority order
#[derive(Debug, Clone)]
pub struct Resolver {
    types: Vec<ClusterType>,
}

impl Resolver {
    pub fn new(mut types: Vec<ClusterType>) -> Self {
        types.retain(|t| t.deleted_at == 0);
        types.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.created_at.cmp(&b.created_at)));
        Self { types }
    }

    pub fn types(&self) -> &[ClusterType] {
        &self.types
    }

    pub fn cluster_type(&self, id: &str) -> Option<&ClusterType> {
        self.types.iter().find(|t| t.id == id)
    }

    /// First type whose tag key the resource carries with a non-blank value
    pub fn resolve(&self, resource: &Resource) -> Option<Resolution<'_>> {
        if resource.is_cluster() || resource.deleted_at != 0 {
            return None;
        }
        self.types.iter().find_map(|cluster_type| {
            let value = resource.tags.get(&cluster_type.tag_key)?;
            if value.trim().is_empty() {
                return None;
            }
            Some(Resolution {
                cluster_type,
                tag_value: value.clone(),
            })
        })
    }

    /// Whether a cluster document is still backed by a live type
    pub fn is_live_cluster(&self, cluster: &Resource) -> bool {
        cluster
            .cluster_type_id
            .as_deref()
            .is_some_and(|id| self.cluster_type(id).is_some())
    }
}

/// Attributes a cluster derives from its members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAggregate {
    pub first_seen: i64,
    pub last_seen: i64,
    pub active: bool,
    pub tags: Tags,
    pub region: Option<String>,
}

struct TagCandidate<'a> {
    value: &'a str,
    member: &'a Resource,
}

impl TagCandidate<'_> {
    /// Total order over members: latest `last_seen`, then smallest
    /// `cloud_resource_id`, `cloud_account_id`, document id and value
    fn rank(&self) -> (Reverse<i64>, &str, Option<&str>, &str, &str) {
        (
            Reverse(self.member.last_seen),
            self.member.cloud_resource_id.as_str(),
            self.member.cloud_account_id.as_deref(),
            self.member.id.as_str(),
            self.value,
        )
    }

    fn beats(&self, other: &TagCandidate<'_>) -> bool {
        self.rank().cmp(&other.rank()) == Ordering::Less
    }
}

impl ClusterAggregate {
    /// Fold members into cluster attributes, `None` for an empty member set
    ///
    /// Tag conflicts resolve to the value of the most recently seen member.
    /// Ties go to the smallest `cloud_resource_id`, then `cloud_account_id`,
    /// then document id.
    pub fn from_members<'a, I>(members: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Resource>,
    {
        let mut iter = members.into_iter();
        let first = iter.next()?;

        let mut first_seen = first.first_seen;
        let mut last_seen = first.last_seen;
        let mut active = first.active;
        let mut region = first.region.clone();
        let mut mixed_region = false;
        let mut tags: HashMap<&str, TagCandidate<'_>> = HashMap::new();

        for member in std::iter::once(first).chain(iter) {
            first_seen = first_seen.min(member.first_seen);
            last_seen = last_seen.max(member.last_seen);
            active |= member.active;
            if member.region != region {
                mixed_region = true;
            }
            for (key, value) in &member.tags {
                let candidate = TagCandidate { value, member };
                match tags.get(key.as_str()) {
                    Some(current) if !candidate.beats(current) => {}
                    _ => {
                        tags.insert(key, candidate);
                    }
                }
            }
        }

        if mixed_region {
            region = None;
        }

        Some(Self {
            first_seen,
            last_seen,
            active,
            tags: tags
                .into_iter()
                .map(|(k, c)| (k.to_string(), c.value.to_string()))
                .collect(),
            region,
        })
    }

    /// Copy the aggregate onto a cluster document, returning whether anything changed
    pub fn apply_to(&self, cluster: &mut Resource) -> bool {
        let changed = cluster.first_seen != self.first_seen
            || cluster.last_seen != self.last_seen
            || cluster.active != self.active
            || cluster.tags != self.tags
            || cluster.region != self.region;
        if changed {
            cluster.first_seen = self.first_seen;
            cluster.last_seen = self.last_seen;
            cluster.active = self.active;
            cluster.tags = self.tags.clone();
            cluster.region = self.region.clone();
        }
        changed
    }
}

/// Fresh cluster document for a resolution, without pool assignment
pub fn new_cluster(organization_id: &str, resolution: &Resolution<'_>, aggregate: &ClusterAggregate) -> Resource {
    let mut cluster = Resource {
        id: new_id(),
        organization_id: organization_id.to_string(),
        cloud_account_id: None,
        cloud_resource_id: resolution.cluster_type.cluster_cloud_resource_id(&resolution.tag_value),
        resource_type: resolution.cluster_type.name.clone(),
        name: Some(resolution.tag_value.clone()),
        region: None,
        tags: Tags::new(),
        first_seen: aggregate.first_seen,
        last_seen: aggregate.last_seen,
        active: aggregate.active,
        pool_id: None,
        employee_id: None,
        cluster_type_id: Some(resolution.cluster_type.id.clone()),
        cluster_id: None,
        applied_rules: Vec::new(),
        deleted_at: 0,
    };
    aggregate.apply_to(&mut cluster);
    cluster
}
