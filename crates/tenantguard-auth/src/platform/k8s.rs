//! Kubernetes API implementations of the platform interfaces
//!
//! - [`TokenReviewResolver`] submits a `TokenReview` to learn who owns a token.
//! - [`RoleBindingSource`] lists and watches `RoleBinding`s; each namespace is
//!   a project and each `roleRef` a role.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use k8s_openapi::api::rbac::v1::{RoleBinding, Subject};
use kube::api::ListParams;
use kube::runtime::watcher;
use kube::{Api, Client};
use tracing::{debug, warn};

use super::{IdentityResolver, ProjectRoleBinding, RbacSource};
use crate::error::{Error, Result, SecurityFailure};

/// Resolves bearer tokens through the TokenReview API
pub struct TokenReviewResolver {
    client: Client,
    audiences: Option<Vec<String>>,
}

impl TokenReviewResolver {
    /// Create a resolver using the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            audiences: None,
        }
    }

    /// Restrict accepted tokens to the given audiences
    pub fn with_audiences(client: Client, audiences: Vec<String>) -> Self {
        Self {
            client,
            audiences: Some(audiences),
        }
    }
}

#[async_trait]
impl IdentityResolver for TokenReviewResolver {
    async fn resolve(&self, token: &str) -> Result<String> {
        let api: Api<TokenReview> = Api::all(self.client.clone());
        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: self.audiences.clone(),
            },
            status: None,
        };

        let result = api
            .create(&Default::default(), &review)
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("TokenReview API error: {}", e)))?;

        let status = result
            .status
            .ok_or_else(|| Error::UpstreamUnavailable("TokenReview returned no status".into()))?;
        username_from_status(&status)
    }
}

/// Extract the owning username from a TokenReview status
fn username_from_status(status: &TokenReviewStatus) -> Result<String> {
    if !status.authenticated.unwrap_or(false) {
        let reason = status
            .error
            .as_deref()
            .unwrap_or("token not authenticated");
        return Err(SecurityFailure::InvalidToken(reason.to_string()).into());
    }

    let username = status
        .user
        .as_ref()
        .and_then(|u| u.username.clone())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            Error::UpstreamUnavailable("TokenReview authenticated but returned no username".into())
        })?;

    debug!(username = %username, "TokenReview resolved token owner");
    Ok(username)
}

/// Lists and watches namespaced RoleBindings
pub struct RoleBindingSource {
    client: Client,
}

impl RoleBindingSource {
    /// Create a source using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RbacSource for RoleBindingSource {
    async fn list_bindings(&self) -> Result<Vec<ProjectRoleBinding>> {
        let api: Api<RoleBinding> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;

        let bindings: Vec<_> = list.items.iter().flat_map(bindings_from).collect();
        debug!(
            role_bindings = list.items.len(),
            bindings = bindings.len(),
            "Listed role bindings"
        );
        Ok(bindings)
    }

    fn changes(&self) -> BoxStream<'static, ()> {
        let api: Api<RoleBinding> = Api::all(self.client.clone());
        // Shorter than the client read timeout so the server closes the watch first
        let config = watcher::Config::default().timeout(25);

        watcher(api, config)
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(_)) | Ok(watcher::Event::Delete(_)) => Some(()),
                    Ok(watcher::Event::InitDone) => Some(()),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "RoleBinding watch error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        None
                    }
                }
            })
            .boxed()
    }
}

/// Flatten one RoleBinding into project role bindings
fn bindings_from(rb: &RoleBinding) -> Vec<ProjectRoleBinding> {
    let Some(project) = rb.metadata.namespace.as_deref() else {
        return Vec::new();
    };
    let role = rb.role_ref.name.as_str();

    rb.subjects
        .iter()
        .flatten()
        .filter_map(principal_name)
        .map(|principal| ProjectRoleBinding::new(project, role, principal))
        .collect()
}

/// Principal name for a subject, or `None` for groups and unknown kinds
fn principal_name(subject: &Subject) -> Option<String> {
    match subject.kind.as_str() {
        "User" => Some(subject.name.clone()),
        "ServiceAccount" => subject
            .namespace
            .as_deref()
            .map(|ns| format!("system:serviceaccount:{}:{}", ns, subject.name)),
        _ => None,
    }
}
