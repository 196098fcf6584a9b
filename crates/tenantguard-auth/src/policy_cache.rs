//! Policy cache
//!
//! Holds exactly one immutable [`PolicySnapshot`] generation at a time and
//! publishes replacements through a `tokio::sync::watch` channel, so readers
//! either see the old generation or the new one, never a mix.
//!
//! # States
//!
//! ```text
//! Uninitialized ──load──► Warm ◄──► Refreshing
//!                          ▲            │ N consecutive failures
//!                          └─ recover ─ Stale
//! ```
//!
//! Construction blocks on the initial load and fails with
//! [`Error::Config`] if it cannot complete. Afterwards a failed refresh keeps
//! serving the last good snapshot; after `stale_threshold` consecutive
//! failures the cache reports [`CacheState::Stale`].
//!
//! Generation numbers are assigned when a refresh starts. A refresh that
//! completes after a later generation was already published is discarded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tenantguard_common::metrics::{self, RefreshResult};
use tenantguard_common::retry::{retry_with_backoff, RetryConfig};

use crate::error::{Error, Result};
use crate::platform::{ProjectRoleBinding, RbacSource};

/// Immutable view of every principal's role bindings at one generation
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    generation: u64,
    fetched_at: DateTime<Utc>,
    by_principal: HashMap<String, Vec<ProjectRoleBinding>>,
}

impl PolicySnapshot {
    /// Build a snapshot, dropping duplicate bindings
    pub fn new(generation: u64, bindings: impl IntoIterator<Item = ProjectRoleBinding>) -> Self {
        let unique: BTreeSet<ProjectRoleBinding> = bindings.into_iter().collect();
        let mut by_principal: HashMap<String, Vec<ProjectRoleBinding>> = HashMap::new();
        for binding in unique {
            by_principal
                .entry(binding.principal.clone())
                .or_default()
                .push(binding);
        }

        Self {
            generation,
            fetched_at: Utc::now(),
            by_principal,
        }
    }

    /// Generation number, strictly increasing across published snapshots
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the bindings were fetched
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Bindings held by `principal` (empty if none)
    pub fn get(&self, principal: &str) -> &[ProjectRoleBinding] {
        self.by_principal
            .get(principal)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of principals with at least one binding
    pub fn principal_count(&self) -> usize {
        self.by_principal.len()
    }

    /// All bindings, in no particular order
    pub fn bindings(&self) -> impl Iterator<Item = &ProjectRoleBinding> {
        self.by_principal.values().flatten()
    }

    /// Principals grouped by (project, role), both levels sorted
    pub fn principals_by_project_role(&self) -> BTreeMap<(String, String), BTreeSet<String>> {
        let mut grouped: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        for binding in self.bindings() {
            grouped
                .entry((binding.project.clone(), binding.role.clone()))
                .or_default()
                .insert(binding.principal.clone());
        }
        grouped
    }
}

/// Lifecycle state of the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No snapshot loaded yet
    Uninitialized,
    /// Serving a snapshot from the latest successful refresh
    Warm,
    /// A refresh is in flight; the previous snapshot is still served
    Refreshing,
    /// Refresh has failed repeatedly; the last good snapshot is served
    Stale,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheState::Uninitialized => "uninitialized",
            CacheState::Warm => "warm",
            CacheState::Refreshing => "refreshing",
            CacheState::Stale => "stale",
        };
        f.write_str(s)
    }
}

/// Tuning for refresh and staleness
#[derive(Debug, Clone)]
pub struct PolicyCacheConfig {
    /// Periodic refresh interval
    pub refresh_interval: Duration,
    /// Bound on a single fetch from the platform
    pub fetch_timeout: Duration,
    /// Consecutive failures before the cache turns stale
    pub stale_threshold: u32,
    /// Backoff for the blocking initial load
    pub initial_load: RetryConfig,
}

impl Default for PolicyCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
            stale_threshold: 3,
            initial_load: RetryConfig::with_max_attempts(3),
        }
    }
}

/// Result of a refresh that fetched successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The fetched bindings were published under this generation
    Published(u64),
    /// A later generation was already published; this one was dropped
    Discarded(u64),
}

#[derive(Debug, Default)]
struct Health {
    consecutive_failures: u32,
    in_flight: u32,
}

/// Cache of the platform's project role bindings
pub struct PolicyCache {
    source: Arc<dyn RbacSource>,
    config: PolicyCacheConfig,
    snapshot: watch::Sender<Arc<PolicySnapshot>>,
    state: watch::Sender<CacheState>,
    health: Mutex<Health>,
    next_generation: AtomicU64,
}

impl PolicyCache {
    /// Create the cache and block until the initial load completes
    ///
    /// Upstream failures are retried per `config.initial_load`; if the load
    /// still fails the cache is not constructed and [`Error::Config`] is returned.
    pub async fn load(source: Arc<dyn RbacSource>, config: PolicyCacheConfig) -> Result<Arc<Self>> {
        let (snapshot, _) = watch::channel(Arc::new(PolicySnapshot::new(0, Vec::new())));
        let (state, _) = watch::channel(CacheState::Uninitialized);
        let cache = Arc::new(Self {
            source,
            config,
            snapshot,
            state,
            health: Mutex::new(Health::default()),
            next_generation: AtomicU64::new(0),
        });

        let bindings = retry_with_backoff(
            &cache.config.initial_load,
            "initial policy load",
            Error::is_upstream_unavailable,
            || cache.fetch(),
        )
        .await
        .map_err(|e| Error::Config(format!("initial policy load failed: {}", e)))?;

        let generation = cache.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        cache.publish(PolicySnapshot::new(generation, bindings));
        cache.state.send_replace(CacheState::Warm);
        info!(generation, "Policy cache warm");

        Ok(cache)
    }

    /// Current snapshot; never waits for a refresh in progress
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Bindings held by `principal` in the current snapshot
    pub fn get(&self, principal: &str) -> Vec<ProjectRoleBinding> {
        self.snapshot().get(principal).to_vec()
    }

    /// Current lifecycle state
    pub fn state(&self) -> CacheState {
        *self.state.borrow()
    }

    /// Whether the cache has crossed the failure threshold
    pub fn is_stale(&self) -> bool {
        self.state() == CacheState::Stale
    }

    /// Receiver notified on every published generation
    pub fn subscribe(&self) -> watch::Receiver<Arc<PolicySnapshot>> {
        self.snapshot.subscribe()
    }

    /// Receiver notified on every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<CacheState> {
        self.state.subscribe()
    }

    /// Fetch all bindings and publish them as a new generation
    ///
    /// On failure the previous snapshot stays published and the failure
    /// counts towards the stale threshold.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.begin_refresh();

        match self.fetch().await {
            Ok(bindings) => {
                let outcome = if self.publish(PolicySnapshot::new(generation, bindings)) {
                    metrics::record_policy_refresh(RefreshResult::Success);
                    RefreshOutcome::Published(generation)
                } else {
                    debug!(generation, "Refresh superseded by a later generation");
                    metrics::record_policy_refresh(RefreshResult::Discarded);
                    RefreshOutcome::Discarded(generation)
                };
                self.end_refresh(true);
                Ok(outcome)
            }
            Err(e) => {
                metrics::record_policy_refresh(RefreshResult::Failure);
                self.end_refresh(false);
                warn!(generation, error = %e, state = %self.state(), "Policy refresh failed");
                Err(e)
            }
        }
    }

    /// Refresh periodically and on platform change notifications until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut changes = self.source.changes();
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the initial load just happened

        info!(
            interval_secs = self.config.refresh_interval.as_secs(),
            "Policy refresh loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Policy refresh loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    debug!("Periodic policy refresh");
                    let _ = self.refresh().await;
                }
                Some(()) = changes.next() => {
                    debug!("Policy change notification");
                    let _ = self.refresh().await;
                }
            }
        }
    }

    async fn fetch(&self) -> Result<Vec<ProjectRoleBinding>> {
        match tokio::time::timeout(self.config.fetch_timeout, self.source.list_bindings()).await {
            Ok(result) => result,
            Err(_) => Err(Error::UpstreamUnavailable(format!(
                "role binding fetch timed out after {:?}",
                self.config.fetch_timeout
            ))),
        }
    }

    /// Publish `snapshot` unless an equal or later generation is already out
    fn publish(&self, snapshot: PolicySnapshot) -> bool {
        let generation = snapshot.generation();
        let principals = snapshot.principal_count();
        let published = self.snapshot.send_if_modified(|current| {
            if generation > current.generation() {
                *current = Arc::new(snapshot);
                true
            } else {
                false
            }
        });

        if published {
            metrics::set_policy_generation(generation);
            debug!(generation, principals, "Published policy snapshot");
        }
        published
    }

    fn begin_refresh(&self) {
        let mut health = self.health.lock();
        health.in_flight += 1;
        if self.state() == CacheState::Warm {
            self.state.send_replace(CacheState::Refreshing);
        }
    }

    fn end_refresh(&self, succeeded: bool) {
        let mut health = self.health.lock();
        health.in_flight = health.in_flight.saturating_sub(1);

        let previous = self.state();
        let next = if succeeded {
            health.consecutive_failures = 0;
            CacheState::Warm
        } else {
            health.consecutive_failures += 1;
            if health.consecutive_failures >= self.config.stale_threshold {
                CacheState::Stale
            } else if previous == CacheState::Stale {
                CacheState::Stale
            } else {
                CacheState::Warm
            }
        };
        let next = if next == CacheState::Warm && health.in_flight > 0 {
            CacheState::Refreshing
        } else {
            next
        };

        if next != previous {
            match (previous, next) {
                (_, CacheState::Stale) => error!(
                    failures = health.consecutive_failures,
                    "Policy cache is stale; serving last good snapshot"
                ),
                (CacheState::Stale, _) => info!("Policy cache recovered"),
                _ => {}
            }
            self.state.send_replace(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;

    /// Scripted RBAC source: each call pops the next response, the last one repeats
    struct ScriptedSource {
        responses: Mutex<VecDeque<(Duration, Result<Vec<ProjectRoleBinding>>)>>,
        calls: AtomicU64,
    }

    impl ScriptedSource {
        fn new(responses: Vec<(Duration, Result<Vec<ProjectRoleBinding>>)>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU64::new(0),
            })
        }

        fn ok(bindings: Vec<ProjectRoleBinding>) -> (Duration, Result<Vec<ProjectRoleBinding>>) {
            (Duration::ZERO, Ok(bindings))
        }

        fn down() -> (Duration, Result<Vec<ProjectRoleBinding>>) {
            (Duration::ZERO, Err(Error::UpstreamUnavailable("connection refused".into())))
        }
    }

    fn clone_response(r: &Result<Vec<ProjectRoleBinding>>) -> Result<Vec<ProjectRoleBinding>> {
        match r {
            Ok(b) => Ok(b.clone()),
            Err(e) => Err(Error::UpstreamUnavailable(e.to_string())),
        }
    }

    #[async_trait]
    impl RbacSource for ScriptedSource {
        async fn list_bindings(&self) -> Result<Vec<ProjectRoleBinding>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, response) = {
                let mut responses = self.responses.lock();
                if responses.len() > 1 {
                    let (d, r) = responses.pop_front().unwrap();
                    (d, r)
                } else {
                    let (d, r) = responses.front().unwrap();
                    (*d, clone_response(r))
                }
            };
            tokio::time::sleep(delay).await;
            response
        }
    }

    fn binding(project: &str, role: &str, principal: &str) -> ProjectRoleBinding {
        ProjectRoleBinding::new(project, role, principal)
    }

    fn fast_config() -> PolicyCacheConfig {
        PolicyCacheConfig {
            refresh_interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(5),
            stale_threshold: 2,
            initial_load: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            },
        }
    }

    #[test]
    fn test_snapshot_indexes_bindings_by_principal_without_duplicates() {
        let snapshot = PolicySnapshot::new(
            1,
            vec![
                binding("logging", "admin", "admin"),
                binding("openshift", "admin", "admin"),
                binding("logging", "admin", "admin"),
                binding("myapp", "view", "dev"),
            ],
        );

        assert_eq!(snapshot.get("admin").len(), 2);
        assert_eq!(snapshot.get("dev"), &[binding("myapp", "view", "dev")]);
        assert!(snapshot.get("nobody").is_empty());
        assert_eq!(snapshot.principal_count(), 2);
    }

    #[test]
    fn test_snapshot_groups_principals_by_project_role() {
        let snapshot = PolicySnapshot::new(
            1,
            vec![
                binding("logging", "admin", "bob"),
                binding("logging", "admin", "alice"),
                binding("logging", "view", "carol"),
            ],
        );
        let grouped = snapshot.principals_by_project_role();
        let admins: Vec<_> = grouped[&("logging".to_string(), "admin".to_string())]
            .iter()
            .cloned()
            .collect();
        assert_eq!(admins, vec!["alice", "bob"]);
        assert_eq!(grouped.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_initial_load_is_a_configuration_error() {
        let source = ScriptedSource::new(vec![ScriptedSource::down()]);
        let err = PolicyCache::load(source.clone(), fast_config()).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_initial_load_retries_transient_failures() {
        let source = ScriptedSource::new(vec![
            ScriptedSource::down(),
            ScriptedSource::ok(vec![binding("logging", "admin", "admin")]),
        ]);
        let cache = PolicyCache::load(source, fast_config()).await.unwrap();

        assert_eq!(cache.state(), CacheState::Warm);
        assert_eq!(cache.snapshot().generation(), 1);
        assert_eq!(cache.get("admin"), vec![binding("logging", "admin", "admin")]);
    }

    #[tokio::test]
    async fn test_refresh_publishes_next_generation_and_old_readers_keep_theirs() {
        let source = ScriptedSource::new(vec![
            ScriptedSource::ok(vec![binding("logging", "admin", "admin")]),
            ScriptedSource::ok(vec![binding("myapp", "admin", "dev")]),
        ]);
        let cache = PolicyCache::load(source, fast_config()).await.unwrap();
        let held = cache.snapshot();

        assert_eq!(cache.refresh().await.unwrap(), RefreshOutcome::Published(2));

        assert_eq!(held.generation(), 1);
        assert_eq!(held.get("admin").len(), 1);
        assert_eq!(cache.snapshot().generation(), 2);
        assert!(cache.get("admin").is_empty());
        assert_eq!(cache.get("dev").len(), 1);
    }

    #[tokio::test]
    async fn test_older_generation_never_replaces_newer() {
        let source = ScriptedSource::new(vec![ScriptedSource::ok(vec![])]);
        let cache = PolicyCache::load(source, fast_config()).await.unwrap();

        assert!(cache.publish(PolicySnapshot::new(5, vec![binding("a", "admin", "x")])));
        assert!(!cache.publish(PolicySnapshot::new(4, vec![binding("b", "admin", "y")])));
        assert!(!cache.publish(PolicySnapshot::new(5, vec![])));

        assert_eq!(cache.snapshot().generation(), 5);
        assert_eq!(cache.get("x").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_refresh_completes_but_is_discarded() {
        let source = ScriptedSource::new(vec![
            ScriptedSource::ok(vec![]),
            (Duration::from_secs(3), Ok(vec![binding("old", "admin", "slow")])),
            ScriptedSource::ok(vec![binding("new", "admin", "fast")]),
        ]);
        let cache = PolicyCache::load(source, fast_config()).await.unwrap();

        let slow = cache.refresh();
        let fast = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.refresh().await
        };
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(fast.unwrap(), RefreshOutcome::Published(3));
        assert_eq!(slow.unwrap(), RefreshOutcome::Discarded(2));
        assert_eq!(cache.snapshot().generation(), 3);
        assert_eq!(cache.get("fast").len(), 1);
        assert!(cache.get("slow").is_empty());
        assert_eq!(cache.state(), CacheState::Warm);
    }

    #[tokio::test]
    async fn test_generations_observed_by_a_subscriber_never_decrease() {
        let source = ScriptedSource::new(vec![ScriptedSource::ok(vec![])]);
        let cache = PolicyCache::load(source, fast_config()).await.unwrap();
        let mut rx = cache.subscribe();
        let mut last = rx.borrow_and_update().generation();

        for _ in 0..5 {
            cache.refresh().await.unwrap();
            let seen = rx.borrow_and_update().generation();
            assert!(seen >= last);
            last = seen;
        }
        assert_eq!(last, 6);
    }

    #[tokio::test]
    async fn test_repeated_failures_turn_stale_and_recovery_turns_warm() {
        let source = ScriptedSource::new(vec![
            ScriptedSource::ok(vec![binding("logging", "admin", "admin")]),
            ScriptedSource::down(),
            ScriptedSource::down(),
            ScriptedSource::down(),
            ScriptedSource::ok(vec![binding("logging", "admin", "admin")]),
        ]);
        let cache = PolicyCache::load(source, fast_config()).await.unwrap();

        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.state(), CacheState::Warm);
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.state(), CacheState::Stale);
        assert!(cache.refresh().await.is_err());
        assert!(cache.is_stale());

        // last good snapshot is still served
        assert_eq!(cache.snapshot().generation(), 1);
        assert_eq!(cache.get("admin").len(), 1);

        assert!(matches!(
            cache.refresh().await.unwrap(),
            RefreshOutcome::Published(_)
        ));
        assert_eq!(cache.state(), CacheState::Warm);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out_as_failure() {
        let source = ScriptedSource::new(vec![
            ScriptedSource::ok(vec![]),
            (Duration::from_secs(30), Ok(vec![])),
        ]);
        let cache = PolicyCache::load(source, fast_config()).await.unwrap();

        let err = cache.refresh().await.unwrap_err();
        assert!(err.is_upstream_unavailable());
        assert_eq!(cache.snapshot().generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_refreshes_on_timer_and_stops_on_cancel() {
        let source = ScriptedSource::new(vec![ScriptedSource::ok(vec![])]);
        let cache = PolicyCache::load(source.clone(), fast_config()).await.unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(cache.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(130)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(cache.snapshot().generation() >= 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), cache.snapshot().generation());
    }
}
