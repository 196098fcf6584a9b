//! Access decision point
//!
//! Authenticates a request with one of the two backends, then authorizes
//! the identity against the current rule list.
//!
//! Precedence:
//!
//! 1. `staticFirst` only: basic credentials for a user in the static table
//!    are authenticated there and nowhere else.
//! 2. A claimed username or bearer token goes to the token ownership
//!    verifier. Without a user header, the basic credentials' username is
//!    the claimed one, so the token must belong to it. An unreachable platform falls back to the static table only
//!    when `allow_static_fallback` is set and basic credentials are present;
//!    otherwise the request is denied.
//! 3. Basic credentials alone go to the static table.
//!
//! A security failure from either backend is final and never retried
//! against the other one.

use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use tenantguard_common::metrics::{self, Decision, DecisionBackend};

use crate::acl::RuleStore;
use crate::credentials::{CredentialExtractor, RequestAuth};
use crate::error::{Error, Result, SecurityFailure};
use crate::file_auth::FileAuthenticationBackend;
use crate::identity::{AuthenticatedIdentity, IdentitySource};
use crate::token_auth::TokenOwnershipVerifier;

/// Which backend is consulted first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthOrder {
    /// Platform-verified tokens first
    #[default]
    DynamicFirst,
    /// Static table first for the users it contains
    StaticFirst,
}

/// An allowed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    /// Who was allowed
    pub identity: AuthenticatedIdentity,
    /// Index pattern that was requested
    pub index: String,
    /// Transport-layer identity, passed through untouched
    pub transport_identity: Option<String>,
}

/// Composes credential extraction, authentication and rule evaluation
pub struct AccessDecisionPoint {
    extractor: CredentialExtractor,
    verifier: TokenOwnershipVerifier,
    static_backend: Arc<FileAuthenticationBackend>,
    rules: Arc<dyn RuleStore>,
    order: AuthOrder,
    allow_static_fallback: bool,
}

impl AccessDecisionPoint {
    /// Create a fail-closed, dynamic-first decision point
    pub fn new(
        extractor: CredentialExtractor,
        verifier: TokenOwnershipVerifier,
        static_backend: Arc<FileAuthenticationBackend>,
        rules: Arc<dyn RuleStore>,
    ) -> Self {
        Self {
            extractor,
            verifier,
            static_backend,
            rules,
            order: AuthOrder::DynamicFirst,
            allow_static_fallback: false,
        }
    }

    /// Set the backend order
    pub fn with_order(mut self, order: AuthOrder) -> Self {
        self.order = order;
        self
    }

    /// Allow static authentication when the platform is unreachable
    pub fn with_static_fallback(mut self, allow: bool) -> Self {
        self.allow_static_fallback = allow;
        self
    }

    /// Authenticate and authorize a request for `index`
    #[instrument(skip(self, headers))]
    pub async fn decide(
        &self,
        headers: &HeaderMap,
        source_host: Option<&str>,
        index: &str,
    ) -> Result<AccessGrant> {
        let request = self.extractor.extract(headers);

        let identity = match self.authenticate(&request).await {
            Ok(identity) => identity,
            Err(e) => {
                let decision = if e.is_upstream_unavailable() {
                    Decision::Unavailable
                } else {
                    Decision::Deny
                };
                metrics::record_auth_decision(DecisionBackend::None, decision);
                return Err(e);
            }
        };

        let backend = match identity.source {
            IdentitySource::Dynamic => DecisionBackend::Dynamic,
            IdentitySource::Static => DecisionBackend::Static,
        };
        if let Err(e) = self.authorize(&identity, source_host, index).await {
            metrics::record_auth_decision(backend, Decision::Deny);
            return Err(e);
        }
        metrics::record_auth_decision(backend, Decision::Allow);

        info!(
            username = %identity.username,
            source = %identity.source,
            index = %index,
            transport_identity = request.transport_identity.as_deref().unwrap_or(""),
            "Access granted"
        );
        Ok(AccessGrant {
            identity,
            index: index.to_string(),
            transport_identity: request.transport_identity,
        })
    }

    /// Authenticate an extracted request
    pub async fn authenticate(&self, request: &RequestAuth) -> Result<AuthenticatedIdentity> {
        if self.order == AuthOrder::StaticFirst {
            if let Some(credentials) = &request.credentials {
                if self.static_backend.exists(credentials.username()) {
                    debug!(username = %credentials.username(), "Static user, skipping token verification");
                    return self.static_backend.authenticate(credentials);
                }
            }
        }

        // basic credentials name the claimed user when no user header is sent
        let claimed = request
            .claimed_user
            .as_deref()
            .or_else(|| request.credentials.as_ref().map(|c| c.username()));

        let dynamic = match (claimed, request.bearer_token.as_deref()) {
            (Some(claimed), Some(token)) => Some(self.verifier.verify(claimed, Some(token)).await),
            (Some(claimed), None) if request.claimed_user.is_some() => {
                Some(self.verifier.verify(claimed, None).await)
            }
            (None, Some(token)) => Some(self.verifier.authenticate_token(token).await),
            _ => None,
        };

        match dynamic {
            Some(Ok(identity)) => Ok(identity),
            Some(Err(e)) if e.is_upstream_unavailable() => self.fall_back(request, e),
            Some(Err(e)) => Err(e),
            None => match &request.credentials {
                Some(credentials) => self.static_backend.authenticate(credentials),
                None => {
                    debug!("Request carries no credentials");
                    Err(SecurityFailure::NoCredentials.into())
                }
            },
        }
    }

    fn fall_back(&self, request: &RequestAuth, cause: Error) -> Result<AuthenticatedIdentity> {
        match (&request.credentials, self.allow_static_fallback) {
            (Some(credentials), true) => {
                warn!(
                    username = %credentials.username(),
                    error = %cause,
                    "Platform unavailable, falling back to static authentication"
                );
                self.static_backend.authenticate(credentials)
            }
            _ => {
                warn!(error = %cause, "Platform unavailable, denying request");
                Err(cause)
            }
        }
    }

    /// Check `identity` against the current rule list
    pub async fn authorize(
        &self,
        identity: &AuthenticatedIdentity,
        source_host: Option<&str>,
        index: &str,
    ) -> Result<()> {
        let current = self.rules.load().await?;
        if current.document.permits(identity, source_host, index) {
            return Ok(());
        }

        warn!(username = %identity.username, index = %index, "No access rule grants the request");
        Err(Error::Forbidden(format!(
            "{} is not permitted to access {}",
            identity.username, index
        )))
    }
}
