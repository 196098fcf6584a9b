//! Sidecar settings
//!
//! Loaded from a YAML file with camelCase keys; every field has a default
//! except the credential file, which [`Settings::validate`] requires.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use tenantguard_common::RetryConfig;

use crate::acl::SyncConfig;
use crate::decision::AuthOrder;
use crate::error::{Error, Result};
use crate::policy_cache::PolicyCacheConfig;

/// Top-level settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Address the decision endpoint listens on
    pub listen_addr: SocketAddr,
    /// Static credential table
    pub static_users_file: String,
    /// JSON rule list maintained by the synchronizer
    pub rule_file: PathBuf,
    /// Which backend authenticates first
    pub auth_order: AuthOrder,
    /// Use the static table when the platform is unreachable
    pub allow_static_fallback: bool,
    /// Header carrying the claimed username
    pub user_header: String,
    /// Header carrying the bearer token
    pub token_header: String,
    /// Header carrying the transport-layer identity
    pub transport_identity_header: String,
    /// Timeout for one token resolution
    pub verify_timeout_secs: u64,
    /// Timeout for one role binding fetch
    pub fetch_timeout_secs: u64,
    /// Periodic policy refresh interval
    pub refresh_interval_secs: u64,
    /// Consecutive refresh failures before the cache is stale
    pub stale_threshold: u32,
    /// Attempts for the initial policy load
    pub initial_load_attempts: u32,
    /// Rule generation
    pub sync: SyncSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            static_users_file: String::new(),
            rule_file: PathBuf::from("/etc/tenantguard/acl.json"),
            auth_order: AuthOrder::default(),
            allow_static_fallback: false,
            user_header: "x-proxy-remote-user".to_string(),
            token_header: "x-forwarded-access-token".to_string(),
            transport_identity_header: "x-ssl-client-subject".to_string(),
            verify_timeout_secs: 5,
            fetch_timeout_secs: 10,
            refresh_interval_secs: 60,
            stale_threshold: 3,
            initial_load_attempts: 3,
            sync: SyncSettings::default(),
        }
    }
}

/// Synchronizer settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    /// Provenance id
    pub id: String,
    /// Roles that produce rules
    pub admin_roles: Vec<String>,
    /// Per-project index patterns
    pub index_patterns: Vec<String>,
    /// Projects granted the operations indices
    pub operations_projects: Vec<String>,
    /// Operations index patterns
    pub operations_index_patterns: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        Self {
            id: defaults.id,
            admin_roles: defaults.admin_roles,
            index_patterns: defaults.index_patterns,
            operations_projects: defaults.operations_projects,
            operations_index_patterns: defaults.operations_index_patterns,
        }
    }
}

impl Settings {
    /// Read and validate settings from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate settings from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the sidecar cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.static_users_file.trim().is_empty() {
            return Err(Error::Config("staticUsersFile must be set".into()));
        }
        for (name, value) in [
            ("userHeader", &self.user_header),
            ("tokenHeader", &self.token_header),
            ("transportIdentityHeader", &self.transport_identity_header),
        ] {
            if axum::http::HeaderName::from_bytes(value.as_bytes()).is_err() {
                return Err(Error::Config(format!("{} is not a valid header name: {:?}", name, value)));
            }
        }
        for (name, value) in [
            ("verifyTimeoutSecs", self.verify_timeout_secs),
            ("fetchTimeoutSecs", self.fetch_timeout_secs),
            ("refreshIntervalSecs", self.refresh_interval_secs),
            ("staleThreshold", u64::from(self.stale_threshold)),
            ("initialLoadAttempts", u64::from(self.initial_load_attempts)),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.sync.id.is_empty() || self.sync.id.contains(':') {
            return Err(Error::Config(format!("sync.id {:?} must be non-empty without ':'", self.sync.id)));
        }
        if self.sync.index_patterns.is_empty() {
            return Err(Error::Config("sync.indexPatterns must not be empty".into()));
        }
        Ok(())
    }

    /// Token resolution timeout
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// Policy cache tuning
    pub fn policy_cache(&self) -> PolicyCacheConfig {
        PolicyCacheConfig {
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            stale_threshold: self.stale_threshold,
            initial_load: RetryConfig::with_max_attempts(self.initial_load_attempts),
        }
    }

    /// Synchronizer configuration
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            id: self.sync.id.clone(),
            admin_roles: self.sync.admin_roles.clone(),
            index_patterns: self.sync.index_patterns.clone(),
            operations_projects: self.sync.operations_projects.clone(),
            operations_index_patterns: self.sync.operations_index_patterns.clone(),
            ..SyncConfig::default()
        }
    }
}
