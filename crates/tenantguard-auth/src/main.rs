//! TenantGuard decision sidecar

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tenantguard_auth::acl::{AclSynchronizer, JsonFileRuleStore};
use tenantguard_auth::config::Settings;
use tenantguard_auth::platform::{RoleBindingSource, TokenReviewResolver};
use tenantguard_auth::server::{start_server, AppState};
use tenantguard_auth::{
    AccessDecisionPoint, CredentialExtractor, FileAuthenticationBackend, PolicyCache,
    TokenOwnershipVerifier,
};
use tenantguard_common::telemetry::{init_telemetry, TelemetryConfig};

/// TenantGuard - token-verified access control for a multi-tenant search engine
#[derive(Parser, Debug)]
#[command(name = "tenantguard", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML settings file
    #[arg(short = 'c', long = "config", env = "TENANTGUARD_CONFIG")]
    config: PathBuf,

    /// Override the listen address from the settings file
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Human readable logs instead of JSON
    #[arg(long)]
    plain_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json: !cli.plain_logs,
        ..Default::default()
    })?;

    let mut settings = Settings::from_file(&cli.config)?;
    if let Some(listen) = cli.listen {
        settings.listen_addr = listen;
    }

    let static_backend = Arc::new(FileAuthenticationBackend::from_path(&settings.static_users_file)?);
    info!(users = static_backend.len(), "Loaded static credentials");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let cache = PolicyCache::load(
        Arc::new(RoleBindingSource::new(client.clone())),
        settings.policy_cache(),
    )
    .await?;

    let rules = Arc::new(JsonFileRuleStore::open(&settings.rule_file)?);
    let synchronizer = Arc::new(AclSynchronizer::new(
        cache.clone(),
        rules.clone(),
        settings.sync_config(),
    ));

    let extractor = CredentialExtractor::new(
        settings.user_header.clone(),
        settings.token_header.clone(),
        settings.transport_identity_header.clone(),
    );
    let verifier = TokenOwnershipVerifier::with_timeout(
        Arc::new(TokenReviewResolver::new(client)),
        settings.verify_timeout(),
    );
    let decision = AccessDecisionPoint::new(extractor, verifier, static_backend, rules.clone())
        .with_order(settings.auth_order)
        .with_static_fallback(settings.allow_static_fallback);

    let cancel = CancellationToken::new();
    let refresh_task = tokio::spawn(cache.clone().run(cancel.clone()));
    let sync_task = tokio::spawn(synchronizer.run(cancel.clone()));
    let reload_task = tokio::spawn(reload_rules(
        rules,
        settings.policy_cache().refresh_interval,
        cancel.clone(),
    ));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    let state = AppState {
        decision: Arc::new(decision),
        cache,
    };
    let served = start_server(settings.listen_addr, state, cancel.clone()).await;

    cancel.cancel();
    let _ = tokio::join!(refresh_task, sync_task, reload_task);
    served?;

    info!("TenantGuard stopped");
    Ok(())
}

/// Pick up operator edits to the rule file
async fn reload_rules(rules: Arc<JsonFileRuleStore>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                match rules.reload().await {
                    Ok(true) => info!(path = %rules.path().display(), "Reloaded rule file"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Failed to reload rule file"),
                }
            }
        }
    }
}
