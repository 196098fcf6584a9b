//! Metrics instruments for tenantguard
//!
//! Instruments hang off the global OpenTelemetry meter. With no meter provider
//! installed they are no-ops, so recording never fails or blocks.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// Global meter for tenantguard metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("tenantguard"));

/// Counter of authentication/authorization outcomes
///
/// Labels:
/// - `backend`: dynamic, static, none
/// - `decision`: allow, deny, unavailable
pub static AUTH_DECISIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("tenantguard_auth_decisions_total")
        .with_description("Total number of access decisions by backend and outcome")
        .with_unit("{decisions}")
        .build()
});

/// Counter of policy cache refresh attempts
///
/// Labels:
/// - `result`: success, failure, discarded
pub static POLICY_REFRESH: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("tenantguard_policy_refresh_total")
        .with_description("Total number of policy cache refresh attempts")
        .with_unit("{refreshes}")
        .build()
});

/// Gauge of the currently published policy snapshot generation
pub static POLICY_GENERATION: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("tenantguard_policy_generation")
        .with_description("Generation number of the published policy snapshot")
        .build()
});

/// Counter of dynamic rule changes committed by the ACL synchronizer
///
/// Labels:
/// - `change`: added, updated, removed
pub static ACL_SYNC_CHANGES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("tenantguard_acl_sync_changes_total")
        .with_description("Total number of dynamic access rules changed by synchronization")
        .with_unit("{rules}")
        .build()
});

/// Which backend produced an access decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionBackend {
    /// Token ownership verification against the platform
    Dynamic,
    /// File-sourced static credentials
    Static,
    /// No backend could be consulted (no credentials)
    None,
}

impl DecisionBackend {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionBackend::Dynamic => "dynamic",
            DecisionBackend::Static => "static",
            DecisionBackend::None => "none",
        }
    }
}

/// Access decision outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request allowed
    Allow,
    /// Request denied (wrong credentials or no matching rule)
    Deny,
    /// Upstream could not be reached and no fallback applied
    Unavailable,
}

impl Decision {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Unavailable => "unavailable",
        }
    }
}

/// Outcome of one policy refresh attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshResult {
    /// A new generation was published
    Success,
    /// The fetch failed or timed out
    Failure,
    /// The fetch completed but a later generation was already published
    Discarded,
}

impl RefreshResult {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshResult::Success => "success",
            RefreshResult::Failure => "failure",
            RefreshResult::Discarded => "discarded",
        }
    }
}

/// Record an access decision
pub fn record_auth_decision(backend: DecisionBackend, decision: Decision) {
    AUTH_DECISIONS.add(
        1,
        &[
            KeyValue::new("backend", backend.as_str()),
            KeyValue::new("decision", decision.as_str()),
        ],
    );
}

/// Record a policy refresh attempt
pub fn record_policy_refresh(result: RefreshResult) {
    POLICY_REFRESH.add(1, &[KeyValue::new("result", result.as_str())]);
}

/// Record the generation number of a newly published snapshot
pub fn set_policy_generation(generation: u64) {
    POLICY_GENERATION.record(generation, &[]);
}

/// Record the rule changes of one committed synchronization pass
pub fn record_acl_sync(added: usize, updated: usize, removed: usize) {
    for (change, count) in [("added", added), ("updated", updated), ("removed", removed)] {
        if count > 0 {
            ACL_SYNC_CHANGES.add(count as u64, &[KeyValue::new("change", change)]);
        }
    }
}
