//! RBAC to rule list synchronization
//!
//! Each pass turns the policy cache's current snapshot into one rule per
//! (project, role) pair for the configured admin roles, then reconciles the
//! rules tagged `dynamic:<id>` in the stored list against that desired set:
//!
//! - rules whose key is no longer wanted are removed
//! - rules whose content drifted are replaced in place
//! - missing keys are appended
//! - matching rules are left as they are
//!
//! Rules with any other provenance are never touched. A rule's key is its
//! comment, `<project>:<role>`; dynamic rules with an unparsable or
//! duplicated key are orphans and are removed.
//!
//! While the cache is stale a pass changes nothing. At most one pass commits
//! per snapshot generation, and a pass whose generation was superseded
//! before commit is dropped.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tenantguard_common::metrics;

use super::{AccessRule, AclDocument, Provenance, RuleStore, DYNAMIC_PREFIX};
use crate::error::{Error, Result};
use crate::policy_cache::{CacheState, PolicyCache, PolicySnapshot};

/// Placeholder substituted with the project name in index patterns
pub const PROJECT_PLACEHOLDER: &str = "{project}";

/// What the synchronizer generates
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Provenance id; rules are tagged `dynamic:<id>`
    pub id: String,
    /// Roles that produce a rule
    pub admin_roles: Vec<String>,
    /// Index patterns granted per project, with `{project}` placeholders
    pub index_patterns: Vec<String>,
    /// Projects whose admins also get the operations indices
    pub operations_projects: Vec<String>,
    /// Operations index patterns
    pub operations_index_patterns: Vec<String>,
    /// Attempts when the rule list moves between load and commit
    pub max_commit_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            id: "rbac".to_string(),
            admin_roles: vec!["admin".to_string()],
            index_patterns: vec!["project.{project}.*".to_string(), "{project}.*".to_string()],
            operations_projects: ["default", "openshift", "openshift-infra", "kube-system", "logging"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            operations_index_patterns: vec![".operations.*".to_string()],
            max_commit_attempts: 3,
        }
    }
}

/// How a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The merged list was committed
    Committed,
    /// The stored list already matched
    NoChange,
    /// This generation was already synchronized
    AlreadySynced,
    /// The cache is stale; nothing was changed
    Deferred,
    /// A newer generation was published before commit
    Superseded,
}

/// Result of one synchronization pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Snapshot generation the pass worked from
    pub generation: u64,
    /// How the pass ended
    pub status: SyncStatus,
    /// Rules appended
    pub added: usize,
    /// Rules replaced in place
    pub updated: usize,
    /// Rules removed, orphans included
    pub removed: usize,
    /// Dynamic rules left untouched
    pub unchanged: usize,
}

impl SyncOutcome {
    fn skipped(generation: u64, status: SyncStatus) -> Self {
        Self {
            generation,
            status,
            added: 0,
            updated: 0,
            removed: 0,
            unchanged: 0,
        }
    }

    /// Whether the pass would change the rule list
    pub fn has_changes(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct RuleKey {
    project: String,
    role: String,
}

impl RuleKey {
    fn parse(comment: &str) -> Option<Self> {
        let (project, role) = comment.split_once(':')?;
        if project.is_empty() || role.is_empty() {
            return None;
        }
        Some(Self {
            project: project.to_string(),
            role: role.to_string(),
        })
    }

    fn comment(&self) -> String {
        format!("{}:{}", self.project, self.role)
    }
}

/// Keeps the synchronizer-owned rules in the rule list aligned with the policy cache
pub struct AclSynchronizer {
    cache: Arc<PolicyCache>,
    store: Arc<dyn RuleStore>,
    config: SyncConfig,
    provenance: Provenance,
    last_synced: Mutex<u64>,
}

impl AclSynchronizer {
    /// Create a synchronizer writing `dynamic:<config.id>` rules into `store`
    pub fn new(cache: Arc<PolicyCache>, store: Arc<dyn RuleStore>, config: SyncConfig) -> Self {
        let provenance = Provenance::Dynamic(config.id.clone());
        Self {
            cache,
            store,
            config,
            provenance,
            last_synced: Mutex::new(0),
        }
    }

    /// Rules the given snapshot calls for, keyed by (project, role)
    fn desired_rules(&self, snapshot: &PolicySnapshot) -> BTreeMap<RuleKey, AccessRule> {
        snapshot
            .principals_by_project_role()
            .into_iter()
            .filter(|((_, role), _)| self.config.admin_roles.contains(role))
            .map(|((project, role), principals)| {
                let mut indices: Vec<String> = self
                    .config
                    .index_patterns
                    .iter()
                    .map(|p| p.replace(PROJECT_PLACEHOLDER, &project))
                    .collect();
                if self.config.operations_projects.contains(&project) {
                    indices.extend(self.config.operations_index_patterns.iter().cloned());
                }

                let key = RuleKey { project, role };
                let rule = AccessRule {
                    acl_source: format!("{}{}", DYNAMIC_PREFIX, self.config.id),
                    comment: key.comment(),
                    users: principals.into_iter().collect(),
                    indices,
                    ..Default::default()
                };
                (key, rule)
            })
            .collect()
    }

    /// Reconcile the owned rules in `rules` against `desired`, in place
    ///
    /// Rules with other provenance keep their values and relative order.
    fn reconcile(
        &self,
        rules: &mut Vec<AccessRule>,
        mut desired: BTreeMap<RuleKey, AccessRule>,
        generation: u64,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome::skipped(generation, SyncStatus::NoChange);
        let mut seen = HashSet::new();
        let mut merged = Vec::with_capacity(rules.len() + desired.len());

        for rule in rules.drain(..) {
            if rule.provenance() != self.provenance {
                merged.push(rule);
                continue;
            }

            let key = match RuleKey::parse(&rule.comment) {
                Some(key) if seen.insert(key.clone()) => key,
                _ => {
                    debug!(comment = %rule.comment, "Dropping orphaned dynamic rule");
                    outcome.removed += 1;
                    continue;
                }
            };

            match desired.remove(&key) {
                Some(wanted) if wanted == rule => {
                    outcome.unchanged += 1;
                    merged.push(rule);
                }
                Some(wanted) => {
                    outcome.updated += 1;
                    merged.push(wanted);
                }
                None => outcome.removed += 1,
            }
        }

        outcome.added = desired.len();
        merged.extend(desired.into_values());
        *rules = merged;
        outcome
    }

    /// Compute the merged rule list for `snapshot` without committing it
    pub fn plan(&self, document: &AclDocument, snapshot: &PolicySnapshot) -> (AclDocument, SyncOutcome) {
        let mut merged = document.clone();
        let outcome = self.reconcile(
            &mut merged.acl,
            self.desired_rules(snapshot),
            snapshot.generation(),
        );
        (merged, outcome)
    }

    /// Run one synchronization pass against the cache's current snapshot
    #[instrument(skip(self), fields(sync_id = %self.config.id))]
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let mut last_synced = self.last_synced.lock().await;
        let snapshot = self.cache.snapshot();
        let generation = snapshot.generation();

        if generation <= *last_synced {
            debug!(generation, "Generation already synchronized");
            return Ok(SyncOutcome::skipped(generation, SyncStatus::AlreadySynced));
        }
        if self.cache.state() == CacheState::Stale {
            warn!(generation, "Policy cache is stale; keeping existing dynamic rules");
            return Ok(SyncOutcome::skipped(generation, SyncStatus::Deferred));
        }

        let attempts = self.config.max_commit_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.store.load().await?;
            let (merged, mut outcome) = self.plan(&current.document, &snapshot);

            if !outcome.has_changes() {
                *last_synced = generation;
                debug!(generation, unchanged = outcome.unchanged, "Rule list already in sync");
                return Ok(outcome);
            }

            let latest = self.cache.snapshot().generation();
            if latest > generation {
                debug!(generation, latest, "Synchronization superseded before commit");
                outcome.status = SyncStatus::Superseded;
                return Ok(outcome);
            }

            match self.store.commit(current.version, merged).await {
                Ok(version) => {
                    *last_synced = generation;
                    outcome.status = SyncStatus::Committed;
                    metrics::record_acl_sync(outcome.added, outcome.updated, outcome.removed);
                    info!(
                        generation,
                        version,
                        added = outcome.added,
                        updated = outcome.updated,
                        removed = outcome.removed,
                        "Committed dynamic access rules"
                    );
                    return Ok(outcome);
                }
                Err(Error::Conflict { expected, found }) if attempt < attempts => {
                    warn!(expected, found, attempt, "Rule list changed during synchronization, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Synchronize on every published generation and on recovery from stale, until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut generations = self.cache.subscribe();
        let mut states = self.cache.subscribe_state();
        info!(sync_id = %self.config.id, "ACL synchronizer started");

        let mut pending = true;
        loop {
            if pending {
                if let Err(e) = self.sync().await {
                    warn!(error = %e, "ACL synchronization failed");
                }
            }

            pending = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ACL synchronizer stopped");
                    return;
                }
                changed = generations.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    true
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    *states.borrow_and_update() == CacheState::Warm
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::acl::{JsonFileRuleStore, MemoryRuleStore, MockRuleStore, VersionedAcl};
    use crate::platform::{ProjectRoleBinding, RbacSource};
    use crate::policy_cache::{PolicyCacheConfig, RefreshOutcome};
    use tenantguard_common::RetryConfig;

    /// Returns whatever bindings were last set, or fails while `down`
    #[derive(Default)]
    struct FakeRbac {
        bindings: parking_lot::Mutex<Vec<ProjectRoleBinding>>,
        down: std::sync::atomic::AtomicBool,
    }

    impl FakeRbac {
        fn set(&self, bindings: Vec<ProjectRoleBinding>) {
            *self.bindings.lock() = bindings;
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RbacSource for FakeRbac {
        async fn list_bindings(&self) -> Result<Vec<ProjectRoleBinding>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::UpstreamUnavailable("api server down".into()));
            }
            Ok(self.bindings.lock().clone())
        }
    }

    fn b(project: &str, role: &str, principal: &str) -> ProjectRoleBinding {
        ProjectRoleBinding::new(project, role, principal)
    }

    fn static_rule(comment: &str) -> AccessRule {
        AccessRule {
            acl_source: "static".into(),
            comment: comment.into(),
            users: vec!["*".into()],
            indices: vec![".kibana".into()],
            filters_execute: vec!["actionrequestfilter.readonly".into()],
            ..Default::default()
        }
    }

    fn other_rule() -> AccessRule {
        AccessRule {
            acl_source: "dynamic:ldap".into(),
            comment: "logging:admin".into(),
            users: vec!["someone".into()],
            indices: vec!["*".into()],
            ..Default::default()
        }
    }

    async fn cache_with(
        rbac: Arc<FakeRbac>,
        bindings: Vec<ProjectRoleBinding>,
    ) -> Arc<PolicyCache> {
        rbac.set(bindings);
        let config = PolicyCacheConfig {
            stale_threshold: 2,
            initial_load: RetryConfig::with_max_attempts(1),
            ..Default::default()
        };
        PolicyCache::load(rbac, config).await.unwrap()
    }

    fn synchronizer(cache: Arc<PolicyCache>, store: Arc<dyn RuleStore>) -> AclSynchronizer {
        AclSynchronizer::new(cache, store, SyncConfig::default())
    }

    fn dynamic_rules(doc: &AclDocument) -> Vec<&AccessRule> {
        doc.iter()
            .filter(|r| r.provenance() == Provenance::Dynamic("rbac".into()))
            .collect()
    }

    #[tokio::test]
    async fn test_generates_one_rule_per_admin_project_role() {
        let rbac = Arc::new(FakeRbac::default());
        let cache = cache_with(
            rbac,
            vec![
                b("logging", "admin", "admin"),
                b("myapp", "admin", "bob"),
                b("myapp", "admin", "alice"),
                b("myapp", "view", "carol"),
            ],
        )
        .await;
        let store = Arc::new(MemoryRuleStore::default());
        let sync = synchronizer(cache, store.clone());

        let outcome = sync.sync().await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Committed);
        assert_eq!(outcome.added, 2);

        let doc = store.document();
        let rules = dynamic_rules(&doc);
        assert_eq!(rules.len(), 2);

        assert_eq!(rules[0].comment, "logging:admin");
        assert_eq!(rules[0].users, vec!["admin"]);
        assert_eq!(
            rules[0].indices,
            vec!["project.logging.*", "logging.*", ".operations.*"]
        );

        assert_eq!(rules[1].comment, "myapp:admin");
        assert_eq!(rules[1].users, vec!["alice", "bob"]);
        assert_eq!(rules[1].indices, vec!["project.myapp.*", "myapp.*"]);
    }

    #[tokio::test]
    async fn test_second_pass_on_same_snapshot_has_no_diff() {
        let rbac = Arc::new(FakeRbac::default());
        let cache = cache_with(rbac, vec![b("logging", "admin", "admin")]).await;
        let store = Arc::new(MemoryRuleStore::default());
        let sync = synchronizer(cache.clone(), store.clone());

        sync.sync().await.unwrap();
        let again = sync.sync().await.unwrap();
        assert_eq!(again.status, SyncStatus::AlreadySynced);
        assert!(!again.has_changes());

        let (_, planned) = sync.plan(&store.document(), &cache.snapshot());
        assert!(!planned.has_changes());
        assert_eq!(planned.unchanged, 1);
    }

    #[tokio::test]
    async fn test_static_and_foreign_rules_are_never_modified() {
        let rbac = Arc::new(FakeRbac::default());
        let cache = cache_with(rbac.clone(), vec![b("logging", "admin", "admin")]).await;
        let seeded = AclDocument::new(vec![
            static_rule("Default is to deny all"),
            other_rule(),
            static_rule("kibana read only"),
        ]);
        let store = Arc::new(MemoryRuleStore::new(seeded.clone()));
        let sync = synchronizer(cache.clone(), store.clone());

        let untouched = |doc: &AclDocument| -> Vec<AccessRule> {
            doc.iter()
                .filter(|r| r.provenance() != Provenance::Dynamic("rbac".into()))
                .cloned()
                .collect()
        };
        let before = untouched(&seeded);

        sync.sync().await.unwrap();
        assert_eq!(untouched(&store.document()), before);

        rbac.set(vec![]);
        cache.refresh().await.unwrap();
        sync.sync().await.unwrap();
        assert_eq!(untouched(&store.document()), before);
        assert!(dynamic_rules(&store.document()).is_empty());
        assert_eq!(
            store.document().to_json().unwrap(),
            seeded.to_json().unwrap()
        );
    }

    #[tokio::test]
    async fn test_updates_in_place_and_removes_dropped_bindings() {
        let rbac = Arc::new(FakeRbac::default());
        let cache = cache_with(
            rbac.clone(),
            vec![b("a", "admin", "x"), b("b", "admin", "y")],
        )
        .await;
        let store = Arc::new(MemoryRuleStore::new(AclDocument::new(vec![static_rule("s")])));
        let sync = synchronizer(cache.clone(), store.clone());
        sync.sync().await.unwrap();

        rbac.set(vec![b("a", "admin", "x"), b("a", "admin", "z")]);
        cache.refresh().await.unwrap();
        let outcome = sync.sync().await.unwrap();

        assert_eq!(outcome.status, SyncStatus::Committed);
        assert_eq!((outcome.added, outcome.updated, outcome.removed), (0, 1, 1));

        let doc = store.document();
        assert_eq!(doc.acl[0], static_rule("s"));
        assert_eq!(doc.acl[1].comment, "a:admin");
        assert_eq!(doc.acl[1].users, vec!["x", "z"]);
        assert_eq!(doc.len(), 2);
    }

    #[tokio::test]
    async fn test_orphans_and_duplicates_are_removed() {
        let rbac = Arc::new(FakeRbac::default());
        let cache = cache_with(rbac, vec![b("a", "admin", "x")]).await;
        let sync = synchronizer(cache.clone(), Arc::new(MemoryRuleStore::default()));

        let dynamic = |comment: &str| AccessRule {
            acl_source: "dynamic:rbac".into(),
            comment: comment.into(),
            ..Default::default()
        };
        let current = AclDocument::new(vec![
            dynamic("no separator"),
            dynamic("a:admin"),
            dynamic("a:admin"),
            dynamic(":admin"),
        ]);

        let (merged, outcome) = sync.plan(&current, &cache.snapshot());
        assert_eq!((outcome.updated, outcome.removed, outcome.added), (1, 3, 0));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.acl[0].users, vec!["x"]);
    }

    #[tokio::test]
    async fn test_stale_cache_defers_and_keeps_existing_grants() {
        let rbac = Arc::new(FakeRbac::default());
        let cache = cache_with(rbac.clone(), vec![b("a", "admin", "x")]).await;
        let store = Arc::new(MemoryRuleStore::default());
        let sync = synchronizer(cache.clone(), store.clone());
        sync.sync().await.unwrap();

        // an operator wipes the list while the platform is unreachable
        store.replace(AclDocument::new(vec![static_rule("s")]));
        rbac.set_down(true);
        assert!(cache.refresh().await.is_err());
        assert!(cache.refresh().await.is_err());
        assert!(cache.is_stale());

        // force a pass for the current generation
        *sync.last_synced.lock().await = 0;
        let outcome = sync.sync().await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Deferred);
        assert_eq!(store.document().len(), 1);

        rbac.set_down(false);
        assert!(matches!(cache.refresh().await.unwrap(), RefreshOutcome::Published(_)));
        let outcome = sync.sync().await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Committed);
        assert_eq!(outcome.added, 1);
    }

    #[tokio::test]
    async fn test_operator_edits_to_the_rule_file_survive_synchronization() {
        let rbac = Arc::new(FakeRbac::default());
        let cache = cache_with(rbac, vec![b("logging", "admin", "admin")]).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acl.json");
        let seeded = AclDocument::new(vec![static_rule("seed")]);
        std::fs::write(&path, seeded.to_json().unwrap()).unwrap();
        let store = Arc::new(JsonFileRuleStore::open(&path).unwrap());

        let edited = AclDocument::new(vec![static_rule("seed"), static_rule("operator-added")]);
        std::fs::write(&path, edited.to_json().unwrap()).unwrap();

        let outcome = synchronizer(cache, store).sync().await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Committed);

        let on_disk = AclDocument::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let statics: Vec<_> = on_disk
            .iter()
            .filter(|r| r.provenance() == Provenance::Static)
            .cloned()
            .collect();
        assert_eq!(statics, edited.acl);
        assert_eq!(dynamic_rules(&on_disk).len(), 1);
    }

    #[tokio::test]
    async fn test_retries_commit_on_conflict() {
        let rbac = Arc::new(FakeRbac::default());
        let cache = cache_with(rbac, vec![b("a", "admin", "x")]).await;

        let commits = Arc::new(AtomicUsize::new(0));
        let mut store = MockRuleStore::new();
        store.expect_load().times(2).returning(|| {
            Ok(VersionedAcl {
                version: 4,
                document: Arc::new(AclDocument::default()),
            })
        });
        let counter = commits.clone();
        store.expect_commit().times(2).returning(move |expected, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Conflict { expected, found: expected + 1 })
            } else {
                Ok(expected + 1)
            }
        });

        let sync = synchronizer(cache, Arc::new(store));
        let outcome = sync.sync().await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Committed);
        assert_eq!(commits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_repeated_conflicts() {
        let rbac = Arc::new(FakeRbac::default());
        let cache = cache_with(rbac, vec![b("a", "admin", "x")]).await;

        let mut store = MockRuleStore::new();
        store.expect_load().times(3).returning(|| {
            Ok(VersionedAcl {
                version: 1,
                document: Arc::new(AclDocument::default()),
            })
        });
        store
            .expect_commit()
            .times(3)
            .returning(|expected, _| Err(Error::Conflict { expected, found: 9 }));

        let sync = synchronizer(cache, Arc::new(store));
        let err = sync.sync().await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_passes_commit_once_per_generation() {
        let rbac = Arc::new(FakeRbac::default());
        let cache = cache_with(rbac, vec![b("a", "admin", "x")]).await;

        let mut store = MockRuleStore::new();
        store.expect_load().times(1).returning(|| {
            Ok(VersionedAcl {
                version: 0,
                document: Arc::new(AclDocument::default()),
            })
        });
        store.expect_commit().times(1).returning(|expected, _| Ok(expected + 1));

        let sync = synchronizer(cache, Arc::new(store));
        let (first, second) = tokio::join!(sync.sync(), sync.sync());
        let mut statuses = vec![first.unwrap().status, second.unwrap().status];
        statuses.sort_by_key(|s| *s == SyncStatus::Committed);
        assert_eq!(statuses, vec![SyncStatus::AlreadySynced, SyncStatus::Committed]);
    }

    #[tokio::test]
    async fn test_run_loop_follows_published_generations() {
        let rbac = Arc::new(FakeRbac::default());
        let cache = cache_with(rbac.clone(), vec![b("a", "admin", "x")]).await;
        let store = Arc::new(MemoryRuleStore::default());
        let sync = Arc::new(synchronizer(cache.clone(), store.clone()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sync.clone().run(cancel.clone()));

        let wait_for = |users: Vec<&'static str>| {
            let store = store.clone();
            async move {
                for _ in 0..200 {
                    let doc = store.document();
                    if dynamic_rules(&doc).first().map(|r| r.users.clone())
                        == Some(users.iter().map(|u| u.to_string()).collect())
                    {
                        return true;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                false
            }
        };

        assert!(wait_for(vec!["x"]).await);
        rbac.set(vec![b("a", "admin", "y")]);
        cache.refresh().await.unwrap();
        assert!(wait_for(vec!["y"]).await);

        cancel.cancel();
        task.await.unwrap();
    }
}
