//! Cluster membership reconciliation.
//!
//! A reconciliation pass takes a closed set of member resources and cluster
//! documents, works out where every member should live, and emits the
//! minimal set of writes that gets the store there:
//!
//! - clusters are created for new groups, recomputed for existing ones and
//!   removed once nothing points at them
//! - members inherit their cluster's pool and owner
//! - members that leave every cluster are handed back to the rules engine
//!
//! The full pass covers a whole organization. The incremental pass used by
//! discovery starts from a few touched resources and widens the set until it
//! is closed (every member's current and desired clusters are in the set and
//! every member of those clusters is too).

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use super::aggregate::{new_cluster, ClusterAggregate, ClusterKey, Resolution, Resolver};
use super::{ClusterError, OrgLocks};
use crate::activity::{publish_quietly, ActivityPublisher};
use crate::db::{
    actions, object_types, ActivityLevel, ClusterType, NewActivityEvent, Organization, Resource,
    ResourceWrite,
};
use crate::rules::RuleSet;
use crate::utils::unix_now;
use crate::DbPool;

/// Outcome of a reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyResult {
    pub processed_resources: usize,
    pub processed_cluster_types: usize,
    pub clusters_created: usize,
    pub clusters_updated: usize,
    pub clusters_removed: usize,
    pub resources_bound: usize,
    pub resources_unbound: usize,
}

impl ApplyResult {
    pub fn is_noop(&self) -> bool {
        self.clusters_created == 0
            && self.clusters_updated == 0
            && self.clusters_removed == 0
            && self.resources_bound == 0
            && self.resources_unbound == 0
    }
}

/// Writes and counters produced by planning
#[derive(Debug, Default)]
struct Plan {
    cluster_writes: Vec<ResourceWrite>,
    member_writes: Vec<ResourceWrite>,
    removals: Vec<ResourceWrite>,
    result: ApplyResult,
}

impl Plan {
    /// Decide the writes for a closed set of members and clusters
    fn build(
        organization_id: &str,
        resolver: &Resolver,
        rules: &RuleSet,
        members: Vec<Resource>,
        clusters: Vec<Resource>,
        now: i64,
    ) -> Self {
        let mut plan = Plan::default();
        plan.result.processed_resources = members.len();
        plan.result.processed_cluster_types = resolver.types().len();

        let mut existing: HashMap<ClusterKey, Resource> = HashMap::new();
        let mut orphaned: Vec<Resource> = Vec::new();
        for cluster in clusters {
            match ClusterKey::of_cluster(&cluster) {
                Some(key) if resolver.is_live_cluster(&cluster) && !existing.contains_key(&key) => {
                    existing.insert(key, cluster);
                }
                _ => orphaned.push(cluster),
            }
        }

        // BTreeMap keeps the write order stable between runs
        let mut groups: BTreeMap<ClusterKey, (String, Vec<Resource>)> = BTreeMap::new();
        let mut loose: Vec<Resource> = Vec::new();
        for member in members {
            match resolver.resolve(&member) {
                Some(resolution) => {
                    groups
                        .entry(resolution.key())
                        .or_insert_with(|| (resolution.tag_value.clone(), Vec::new()))
                        .1
                        .push(member);
                }
                None => loose.push(member),
            }
        }

        for (key, (tag_value, group)) in groups {
            let Some(aggregate) = ClusterAggregate::from_members(group.iter()) else {
                continue;
            };

            let cluster = match existing.remove(&key) {
                Some(mut cluster) => {
                    let mut changed = aggregate.apply_to(&mut cluster);
                    if cluster.pool_id.is_none() {
                        assign(&mut cluster, rules);
                        changed = true;
                    }
                    if changed {
                        plan.result.clusters_updated += 1;
                        plan.cluster_writes.push(ResourceWrite::Replace(cluster.clone()));
                    }
                    cluster
                }
                None => {
                    let Some(cluster_type) = resolver.cluster_type(&key.cluster_type_id) else {
                        continue;
                    };
                    let resolution = Resolution {
                        cluster_type,
                        tag_value,
                    };
                    let mut cluster = new_cluster(organization_id, &resolution, &aggregate);
                    assign(&mut cluster, rules);
                    plan.result.clusters_created += 1;
                    plan.cluster_writes.push(ResourceWrite::Insert(cluster.clone()));
                    cluster
                }
            };

            for mut member in group {
                let rebinding = member.cluster_id.as_deref() != Some(cluster.id.as_str());
                let inherits = member.pool_id == cluster.pool_id
                    && member.employee_id == cluster.employee_id
                    && member.applied_rules == cluster.applied_rules;
                if !rebinding && inherits {
                    continue;
                }
                if rebinding {
                    plan.result.resources_bound += 1;
                }
                member.cluster_id = Some(cluster.id.clone());
                member.pool_id = cluster.pool_id.clone();
                member.employee_id = cluster.employee_id.clone();
                member.applied_rules = cluster.applied_rules.clone();
                plan.member_writes.push(ResourceWrite::Replace(member));
            }
        }

        for mut member in loose {
            if member.cluster_id.is_some() {
                member.cluster_id = None;
                assign(&mut member, rules);
                plan.result.resources_unbound += 1;
                plan.member_writes.push(ResourceWrite::Replace(member));
            } else if member.pool_id.is_none() {
                assign(&mut member, rules);
                plan.member_writes.push(ResourceWrite::Replace(member));
            }
        }

        for cluster in existing.into_values().chain(orphaned) {
            plan.result.clusters_removed += 1;
            plan.removals.push(ResourceWrite::Remove {
                id: cluster.id,
                deleted_at: now,
            });
        }

        plan
    }

    fn into_writes(self) -> (Vec<ResourceWrite>, ApplyResult) {
        let mut writes = self.cluster_writes;
        writes.extend(self.member_writes);
        writes.extend(self.removals);
        (writes, self.result)
    }
}

fn assign(resource: &mut Resource, rules: &RuleSet) {
    let assignment = rules.resolve(resource);
    resource.pool_id = Some(assignment.pool_id);
    resource.employee_id = assignment.employee_id;
    resource.applied_rules = assignment.applied_rules;
}

/// Runs reconciliation passes against the store
#[derive(Clone)]
pub struct ClusterApplier {
    db: DbPool,
    publisher: Arc<dyn ActivityPublisher>,
    locks: OrgLocks,
    batch_size: usize,
}

impl ClusterApplier {
    pub fn new(db: DbPool, publisher: Arc<dyn ActivityPublisher>, batch_size: usize) -> Self {
        Self {
            db,
            publisher,
            locks: OrgLocks::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    pub fn publisher(&self) -> &Arc<dyn ActivityPublisher> {
        &self.publisher
    }

    pub fn locks(&self) -> &OrgLocks {
        &self.locks
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Reapply every cluster type of an organization
    pub async fn apply(&self, organization_id: &str) -> Result<ApplyResult, ClusterError> {
        let _guard = self.locks.lock(organization_id).await;
        self.apply_locked(organization_id).await
    }

    /// Full pass for callers that already hold the organization lock
    pub(crate) async fn apply_locked(&self, organization_id: &str) -> Result<ApplyResult, ClusterError> {
        Organization::get(&self.db, organization_id)
            .await?
            .ok_or_else(|| ClusterError::not_found("Organization", organization_id))?;

        publish_quietly(
            self.publisher.as_ref(),
            NewActivityEvent::info(
                organization_id,
                object_types::ORGANIZATION,
                organization_id,
                actions::CLUSTER_TYPES_PROCESSING_STARTED,
            ),
        )
        .await;

        let started = Instant::now();
        match self.full_pass(organization_id).await {
            Ok(result) => {
                let elapsed = started.elapsed();
                crate::metrics::record_apply(&result, elapsed);
                tracing::info!(
                    organization_id = %organization_id,
                    resources = result.processed_resources,
                    cluster_types = result.processed_cluster_types,
                    created = result.clusters_created,
                    updated = result.clusters_updated,
                    removed = result.clusters_removed,
                    bound = result.resources_bound,
                    unbound = result.resources_unbound,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Cluster types applied"
                );
                publish_quietly(
                    self.publisher.as_ref(),
                    NewActivityEvent::info(
                        organization_id,
                        object_types::ORGANIZATION,
                        organization_id,
                        actions::CLUSTER_TYPES_PROCESSING_DONE,
                    )
                    .with_payload(serde_json::to_value(&result)?),
                )
                .await;
                Ok(result)
            }
            Err(e) => {
                tracing::error!(organization_id = %organization_id, error = %e, "Cluster type processing failed");
                publish_quietly(
                    self.publisher.as_ref(),
                    NewActivityEvent::info(
                        organization_id,
                        object_types::ORGANIZATION,
                        organization_id,
                        actions::CLUSTER_TYPES_PROCESSING_FAILED,
                    )
                    .with_level(ActivityLevel::Error)
                    .with_payload(serde_json::json!({ "error": e.to_string() })),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn full_pass(&self, organization_id: &str) -> Result<ApplyResult, ClusterError> {
        let (types, members, clusters) = {
            let mut conn = self.db.acquire().await?;
            let types = ClusterType::list_in(&mut conn, organization_id).await?;
            let members = Resource::list_members(&mut conn, organization_id).await?;
            let clusters = Resource::list_clusters(&mut conn, organization_id).await?;
            (types, members, clusters)
        };

        let resolver = Resolver::new(types);
        let rules = RuleSet::load(&self.db, organization_id).await?;
        let plan = Plan::build(organization_id, &resolver, &rules, members, clusters, unix_now());
        self.execute(plan).await
    }

    /// Bind freshly imported or changed resources to their clusters
    pub async fn bind(&self, organization_id: &str, resource_ids: &[String]) -> Result<ApplyResult, ClusterError> {
        let _guard = self.locks.lock(organization_id).await;
        self.bind_locked(organization_id, resource_ids).await
    }

    /// Incremental pass for callers that already hold the organization lock
    pub(crate) async fn bind_locked(
        &self,
        organization_id: &str,
        resource_ids: &[String],
    ) -> Result<ApplyResult, ClusterError> {
        let mut conn = self.db.acquire().await?;
        let resolver = Resolver::new(ClusterType::list_in(&mut conn, organization_id).await?);

        let mut members: HashMap<String, Resource> = Resource::list_by_ids(&mut conn, resource_ids)
            .await?
            .into_iter()
            .filter(|r| r.organization_id == organization_id && !r.is_cluster())
            .map(|r| (r.id.clone(), r))
            .collect();
        if members.is_empty() {
            return Ok(ApplyResult {
                processed_cluster_types: resolver.types().len(),
                ..ApplyResult::default()
            });
        }

        let mut clusters: HashMap<String, Resource> = HashMap::new();
        let mut seen_members: HashSet<String> = HashSet::new();

        // Widen until every member's current and desired cluster is loaded
        // and every member of a loaded cluster is part of the set
        loop {
            let fresh: Vec<&Resource> = members
                .values()
                .filter(|m| !seen_members.contains(&m.id))
                .collect();
            if fresh.is_empty() {
                break;
            }

            let current_ids: Vec<String> = fresh
                .iter()
                .filter_map(|m| m.cluster_id.clone())
                .filter(|id| !clusters.contains_key(id))
                .collect();
            let desired_cloud_ids: Vec<String> = fresh
                .iter()
                .filter_map(|m| resolver.resolve(m).map(|r| r.key().cloud_resource_id))
                .collect();
            seen_members.extend(fresh.iter().map(|m| m.id.clone()));

            let mut new_cluster_ids = Vec::new();
            let found = Resource::list_by_ids(&mut conn, &current_ids)
                .await?
                .into_iter()
                .filter(|c| c.is_cluster() && c.organization_id == organization_id)
                .chain(
                    Resource::list_clusters_by_cloud_ids(&mut conn, organization_id, &desired_cloud_ids)
                        .await?,
                );
            for cluster in found {
                if !clusters.contains_key(&cluster.id) {
                    new_cluster_ids.push(cluster.id.clone());
                    clusters.insert(cluster.id.clone(), cluster);
                }
            }

            for member in Resource::list_bound_to(&mut conn, &new_cluster_ids).await? {
                if !member.is_cluster() {
                    members.entry(member.id.clone()).or_insert(member);
                }
            }
        }
        drop(conn);

        let rules = RuleSet::load(&self.db, organization_id).await?;
        let plan = Plan::build(
            organization_id,
            &resolver,
            &rules,
            members.into_values().collect(),
            clusters.into_values().collect(),
            unix_now(),
        );
        let result = self.execute(plan).await?;

        tracing::debug!(
            organization_id = %organization_id,
            resources = result.processed_resources,
            created = result.clusters_created,
            removed = result.clusters_removed,
            bound = result.resources_bound,
            unbound = result.resources_unbound,
            "Resources bound to clusters"
        );

        Ok(result)
    }

    async fn execute(&self, plan: Plan) -> Result<ApplyResult, ClusterError> {
        let (writes, result) = plan.into_writes();
        if !writes.is_empty() {
            Resource::bulk_write(&self.db, writes, self.batch_size).await?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::MemoryActivityPublisher;
    use crate::db::models::resource::fixtures::{member, with_tags};
    use crate::db::{
        init_memory, CloudAccount, CloudType, Condition, ConditionType, CreateAssignmentRule,
        Employee, OrganizationBundle, Pool,
    };
    use crate::rules::RulesError;
    use crate::utils::{new_id, rfc3339_now};

    struct Fixture {
        db: DbPool,
        org: OrganizationBundle,
        account: CloudAccount,
        publisher: Arc<MemoryActivityPublisher>,
        applier: ClusterApplier,
    }

    impl Fixture {
        async fn new() -> Self {
            let db = init_memory().await.unwrap();
            let org = Organization::create(&db, "Acme", "Owner").await.unwrap();
            let account = CloudAccount::create(&db, &org.organization.id, "aws", CloudType::AwsCnr)
                .await
                .unwrap();
            let publisher = Arc::new(MemoryActivityPublisher::new());
            let applier = ClusterApplier::new(db.clone(), publisher.clone(), 2);
            Self {
                db,
                org,
                account,
                publisher,
                applier,
            }
        }

        fn org_id(&self) -> &str {
            &self.org.organization.id
        }

        async fn add_type(&self, name: &str, tag_key: &str, priority: i64) -> ClusterType {
            let ct = ClusterType {
                id: new_id(),
                organization_id: self.org_id().to_string(),
                name: name.to_string(),
                tag_key: tag_key.to_string(),
                priority,
                created_at: rfc3339_now(),
                deleted_at: 0,
            };
            let mut conn = self.db.acquire().await.unwrap();
            ClusterType::insert(&mut conn, &ct).await.unwrap();
            ct
        }

        async fn add_resource(&self, cloud_resource_id: &str, tags: &[(&str, &str)]) -> Resource {
            let resource = with_tags(member(self.org_id(), &self.account.id, cloud_resource_id), tags);
            let mut conn = self.db.acquire().await.unwrap();
            Resource::insert(&mut conn, &resource).await.unwrap();
            resource
        }

        async fn save(&self, resource: &Resource) {
            let mut conn = self.db.acquire().await.unwrap();
            Resource::replace(&mut conn, resource).await.unwrap();
        }

        async fn get(&self, id: &str) -> Resource {
            Resource::get(&self.db, id).await.unwrap().unwrap()
        }

        async fn clusters(&self) -> Vec<Resource> {
            let mut conn = self.db.acquire().await.unwrap();
            Resource::list_clusters(&mut conn, self.org_id()).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_apply_groups_by_tag_value() {
        let fx = Fixture::new().await;
        fx.add_type("Application", "app", 1).await;
        let a = fx.add_resource("i-a", &[("app", "billing")]).await;
        let b = fx.add_resource("i-b", &[("app", "billing")]).await;
        let c = fx.add_resource("i-c", &[("app", "search")]).await;
        let d = fx.add_resource("i-d", &[("team", "core")]).await;

        let result = fx.applier.apply(fx.org_id()).await.unwrap();
        assert_eq!(result.processed_resources, 4);
        assert_eq!(result.processed_cluster_types, 1);
        assert_eq!(result.clusters_created, 2);
        assert_eq!(result.resources_bound, 3);

        let clusters = fx.clusters().await;
        assert_eq!(clusters.len(), 2);
        let billing = clusters.iter().find(|c| c.cloud_resource_id == "app:billing").unwrap();
        assert_eq!(billing.resource_type, "Application");
        assert_eq!(billing.name.as_deref(), Some("billing"));
        assert_eq!(billing.pool_id.as_deref(), Some(fx.org.root_pool.id.as_str()));

        assert_eq!(fx.get(&a.id).await.cluster_id.as_deref(), Some(billing.id.as_str()));
        assert_eq!(fx.get(&b.id).await.cluster_id.as_deref(), Some(billing.id.as_str()));
        assert_ne!(fx.get(&c.id).await.cluster_id.as_deref(), Some(billing.id.as_str()));

        let loose = fx.get(&d.id).await;
        assert!(loose.cluster_id.is_none());
        assert_eq!(loose.pool_id.as_deref(), Some(fx.org.root_pool.id.as_str()));

        assert_eq!(
            fx.publisher.actions().await,
            vec![
                actions::CLUSTER_TYPES_PROCESSING_STARTED.to_string(),
                actions::CLUSTER_TYPES_PROCESSING_DONE.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let fx = Fixture::new().await;
        fx.add_type("Application", "app", 1).await;
        fx.add_resource("i-a", &[("app", "billing")]).await;
        fx.add_resource("i-b", &[("app", "billing"), ("owner", "bob")]).await;
        fx.add_resource("i-c", &[]).await;

        let first = fx.applier.apply(fx.org_id()).await.unwrap();
        assert!(!first.is_noop());
        let before = fx.clusters().await;

        let second = fx.applier.apply(fx.org_id()).await.unwrap();
        assert!(second.is_noop(), "second run changed something: {:?}", second);
        assert_eq!(second.processed_resources, 3);
        assert_eq!(fx.clusters().await, before);
    }

    #[tokio::test]
    async fn test_cluster_aggregates_member_lifecycle() {
        let fx = Fixture::new().await;
        fx.add_type("Application", "app", 1).await;
        let mut a = fx.add_resource("i-a", &[("app", "billing"), ("owner", "alice")]).await;
        a.first_seen = 10;
        a.last_seen = 100;
        a.active = false;
        fx.save(&a).await;
        let mut b = fx.add_resource("i-b", &[("app", "billing"), ("owner", "bob")]).await;
        b.first_seen = 50;
        b.last_seen = 300;
        fx.save(&b).await;

        fx.applier.apply(fx.org_id()).await.unwrap();
        let cluster = fx.clusters().await.pop().unwrap();
        assert_eq!(cluster.first_seen, 10);
        assert_eq!(cluster.last_seen, 300);
        assert!(cluster.active);
        assert_eq!(cluster.tags.get("owner").map(String::as_str), Some("bob"));

        b.active = false;
        fx.save(&b).await;
        let result = fx.applier.apply(fx.org_id()).await.unwrap();
        assert_eq!(result.clusters_updated, 1);
        assert!(!fx.clusters().await[0].active);
    }

    #[tokio::test]
    async fn test_priority_decides_membership() {
        let fx = Fixture::new().await;
        let team = fx.add_type("Team", "team", 1).await;
        fx.add_type("Application", "app", 2).await;
        let r = fx.add_resource("i-a", &[("app", "billing"), ("team", "core")]).await;

        fx.applier.apply(fx.org_id()).await.unwrap();
        let clusters = fx.clusters().await;
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].cluster_type_id.as_deref(), Some(team.id.as_str()));
        assert_eq!(fx.get(&r.id).await.cluster_id.as_deref(), Some(clusters[0].id.as_str()));

        // Swap priorities: the resource moves and the emptied cluster goes away
        let mut conn = fx.db.acquire().await.unwrap();
        ClusterType::set_priority(&mut conn, &team.id, 3).await.unwrap();
        drop(conn);

        let result = fx.applier.apply(fx.org_id()).await.unwrap();
        assert_eq!(result.clusters_created, 1);
        assert_eq!(result.clusters_removed, 1);
        assert_eq!(result.resources_bound, 1);
        let clusters = fx.clusters().await;
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].cloud_resource_id, "app:billing");
    }

    #[tokio::test]
    async fn test_tag_removal_unbinds_and_reassigns_through_rules() {
        let fx = Fixture::new().await;
        fx.add_type("Application", "app", 1).await;
        let dev = Employee::create(&fx.db, fx.org_id(), "Dev").await.unwrap();
        let pool = Pool::create_child(&fx.db, &fx.org.root_pool, "Core", Some(&dev.id))
            .await
            .unwrap();
        let rule = crate::rules::create_rule(
            &fx.db,
            fx.org_id(),
            CreateAssignmentRule {
                name: "core team".to_string(),
                active: true,
                pool_id: pool.id.clone(),
                owner_id: dev.id.clone(),
                conditions: vec![Condition::tag(ConditionType::TagIs, "team", "core")],
            },
        )
        .await
        .unwrap();

        let mut r = fx.add_resource("i-a", &[("app", "billing"), ("team", "core")]).await;
        fx.add_resource("i-b", &[("app", "billing")]).await;
        fx.applier.apply(fx.org_id()).await.unwrap();

        // The cluster carries the merged tags, so the rule claims it
        let cluster = fx.clusters().await.pop().unwrap();
        assert_eq!(cluster.pool_id.as_deref(), Some(pool.id.as_str()));
        let bound = fx.get(&r.id).await;
        assert_eq!(bound.pool_id.as_deref(), Some(pool.id.as_str()));
        assert_eq!(bound.applied_rules[0].id, rule.id);

        r = fx.get(&r.id).await;
        r.tags.remove("app");
        fx.save(&r).await;

        let result = fx.applier.apply(fx.org_id()).await.unwrap();
        assert_eq!(result.resources_unbound, 1);
        assert_eq!(result.clusters_removed, 0);
        let unbound = fx.get(&r.id).await;
        assert!(unbound.cluster_id.is_none());
        assert_eq!(unbound.pool_id.as_deref(), Some(pool.id.as_str()));
        assert_eq!(unbound.employee_id.as_deref(), Some(dev.id.as_str()));
    }

    #[tokio::test]
    async fn test_existing_cluster_keeps_manual_assignment() {
        let fx = Fixture::new().await;
        fx.add_type("Application", "app", 1).await;
        let a = fx.add_resource("i-a", &[("app", "billing")]).await;
        fx.applier.apply(fx.org_id()).await.unwrap();

        let dev = Employee::create(&fx.db, fx.org_id(), "Dev").await.unwrap();
        let pool = Pool::create_child(&fx.db, &fx.org.root_pool, "Manual", Some(&dev.id))
            .await
            .unwrap();
        let mut cluster = fx.clusters().await.pop().unwrap();
        cluster.pool_id = Some(pool.id.clone());
        cluster.employee_id = Some(dev.id.clone());
        fx.save(&cluster).await;

        let b = fx.add_resource("i-b", &[("app", "billing")]).await;
        let result = fx.applier.apply(fx.org_id()).await.unwrap();
        assert_eq!(result.clusters_created, 0);
        assert_eq!(result.resources_bound, 1);

        for id in [&a.id, &b.id] {
            let m = fx.get(id).await;
            assert_eq!(m.pool_id.as_deref(), Some(pool.id.as_str()));
            assert_eq!(m.employee_id.as_deref(), Some(dev.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_no_cluster_types_dissolves_everything() {
        let fx = Fixture::new().await;
        let ct = fx.add_type("Application", "app", 1).await;
        let a = fx.add_resource("i-a", &[("app", "billing")]).await;
        fx.applier.apply(fx.org_id()).await.unwrap();

        let mut conn = fx.db.acquire().await.unwrap();
        ClusterType::mark_deleted(&mut conn, &ct.id, unix_now()).await.unwrap();
        drop(conn);

        let result = fx.applier.apply(fx.org_id()).await.unwrap();
        assert_eq!(result.processed_cluster_types, 0);
        assert_eq!(result.clusters_removed, 1);
        assert_eq!(result.resources_unbound, 1);
        assert!(fx.clusters().await.is_empty());
        assert!(fx.get(&a.id).await.cluster_id.is_none());
    }

    #[tokio::test]
    async fn test_bind_touches_only_affected_clusters() {
        let fx = Fixture::new().await;
        fx.add_type("Application", "app", 1).await;
        let a = fx.add_resource("i-a", &[("app", "billing")]).await;
        fx.add_resource("i-b", &[("app", "search")]).await;
        fx.applier.apply(fx.org_id()).await.unwrap();

        let mut c = fx.add_resource("i-c", &[("app", "billing")]).await;
        c.last_seen = 9_999;
        fx.save(&c).await;

        let result = fx.applier.bind(fx.org_id(), &[c.id.clone()]).await.unwrap();
        assert_eq!(result.processed_resources, 2);
        assert_eq!(result.clusters_created, 0);
        assert_eq!(result.clusters_updated, 1);
        assert_eq!(result.resources_bound, 1);

        let billing = fx
            .clusters()
            .await
            .into_iter()
            .find(|cl| cl.cloud_resource_id == "app:billing")
            .unwrap();
        assert_eq!(billing.last_seen, 9_999);
        assert_eq!(fx.get(&c.id).await.cluster_id, fx.get(&a.id).await.cluster_id);

        // A full pass afterwards agrees with the incremental one
        assert!(fx.applier.apply(fx.org_id()).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn test_bind_moves_resource_and_removes_emptied_cluster() {
        let fx = Fixture::new().await;
        fx.add_type("Application", "app", 1).await;
        let mut a = fx.add_resource("i-a", &[("app", "billing")]).await;
        fx.applier.apply(fx.org_id()).await.unwrap();

        a = fx.get(&a.id).await;
        a.tags.insert("app".to_string(), "search".to_string());
        fx.save(&a).await;

        let result = fx.applier.bind(fx.org_id(), &[a.id.clone()]).await.unwrap();
        assert_eq!(result.clusters_created, 1);
        assert_eq!(result.clusters_removed, 1);
        assert_eq!(result.resources_bound, 1);

        let clusters = fx.clusters().await;
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].cloud_resource_id, "app:search");
        assert!(fx.applier.apply(fx.org_id()).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn test_bind_ignores_foreign_and_cluster_ids() {
        let fx = Fixture::new().await;
        fx.add_type("Application", "app", 1).await;
        fx.add_resource("i-a", &[("app", "billing")]).await;
        fx.applier.apply(fx.org_id()).await.unwrap();
        let cluster = fx.clusters().await.pop().unwrap();

        let result = fx
            .applier
            .bind(fx.org_id(), &[cluster.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(result.processed_resources, 0);
        assert!(result.is_noop());
    }

    #[tokio::test]
    async fn test_bind_dissolves_cluster_of_deleted_type() {
        let fx = Fixture::new().await;
        let ct = fx.add_type("Application", "app", 1).await;
        let a = fx.add_resource("i-a", &[("app", "billing")]).await;
        let b = fx.add_resource("i-b", &[("app", "billing")]).await;
        fx.applier.apply(fx.org_id()).await.unwrap();
        assert_eq!(fx.clusters().await.len(), 1);

        let mut conn = fx.db.acquire().await.unwrap();
        ClusterType::mark_deleted(&mut conn, &ct.id, unix_now()).await.unwrap();
        drop(conn);

        let result = fx.applier.bind(fx.org_id(), &[a.id.clone()]).await.unwrap();
        assert_eq!(result.processed_resources, 2);
        assert_eq!(result.clusters_removed, 1);
        assert_eq!(result.resources_unbound, 2);
        assert!(fx.clusters().await.is_empty());

        for id in [&a.id, &b.id] {
            let m = fx.get(id).await;
            assert!(m.cluster_id.is_none());
            assert_eq!(m.pool_id.as_deref(), Some(fx.org.root_pool.id.as_str()));
        }
        assert!(fx.applier.apply(fx.org_id()).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn test_same_resource_id_in_two_accounts_settles() {
        let fx = Fixture::new().await;
        fx.add_type("Application", "app", 1).await;
        let other = CloudAccount::create(&fx.db, fx.org_id(), "aws-2", CloudType::AwsCnr)
            .await
            .unwrap();
        let first = fx.add_resource("i-1", &[("app", "billing"), ("owner", "alice")]).await;
        let second = with_tags(
            member(fx.org_id(), &other.id, "i-1"),
            &[("app", "billing"), ("owner", "bob")],
        );
        let mut conn = fx.db.acquire().await.unwrap();
        Resource::insert(&mut conn, &second).await.unwrap();
        drop(conn);

        fx.applier.apply(fx.org_id()).await.unwrap();
        let cluster = fx.clusters().await.pop().unwrap();
        let expected = if fx.account.id < other.id { "alice" } else { "bob" };
        assert_eq!(cluster.tags.get("owner").map(String::as_str), Some(expected));

        for _ in 0..10 {
            let bound = fx.applier.bind(fx.org_id(), &[first.id.clone()]).await.unwrap();
            assert!(bound.is_noop(), "bind rewrote unchanged data: {:?}", bound);
            let applied = fx.applier.apply(fx.org_id()).await.unwrap();
            assert!(applied.is_noop(), "apply rewrote unchanged data: {:?}", applied);
        }
    }

    #[tokio::test]
    async fn test_apply_failure_publishes_error_event() {
        let fx = Fixture::new().await;
        fx.add_type("Application", "app", 1).await;
        fx.add_resource("i-a", &[("app", "billing")]).await;
        sqlx::query("DELETE FROM pools WHERE id = ?")
            .bind(&fx.org.root_pool.id)
            .execute(&fx.db)
            .await
            .unwrap();

        let err = fx.applier.apply(fx.org_id()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Rules(RulesError::NoRootPool(_))));

        assert_eq!(
            fx.publisher.actions().await,
            vec![
                actions::CLUSTER_TYPES_PROCESSING_STARTED.to_string(),
                actions::CLUSTER_TYPES_PROCESSING_FAILED.to_string()
            ]
        );
        let events = fx.publisher.events().await;
        assert_eq!(events[0].level, ActivityLevel::Info);
        assert_eq!(events[1].level, ActivityLevel::Error);
        assert!(fx.clusters().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_unknown_organization() {
        let fx = Fixture::new().await;
        let err = fx.applier.apply("ghost").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound { .. }));
    }

    #[test]
    fn test_apply_result_noop() {
        let mut result = ApplyResult {
            processed_resources: 10,
            processed_cluster_types: 2,
            ..ApplyResult::default()
        };
        assert!(result.is_noop());
        result.resources_unbound = 1;
        assert!(!result.is_noop());
    }
}
