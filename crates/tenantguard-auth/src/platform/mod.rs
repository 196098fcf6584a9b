//! Orchestration platform interfaces
//!
//! The verifier and policy cache only talk to the platform through these
//! traits. [`k8s`] provides the Kubernetes-API-backed implementations.

use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod k8s;

pub use self::k8s::{RoleBindingSource, TokenReviewResolver};

/// A role held by a principal within a project
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectRoleBinding {
    /// Project (tenant namespace) name
    pub project: String,
    /// Role name
    pub role: String,
    /// Principal holding the role
    pub principal: String,
}

impl ProjectRoleBinding {
    /// Create a binding
    pub fn new(
        project: impl Into<String>,
        role: impl Into<String>,
        principal: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            role: role.into(),
            principal: principal.into(),
        }
    }
}

/// Resolves a bearer token to the principal that owns it
///
/// Implementations must distinguish a rejected token
/// ([`SecurityFailure::InvalidToken`](crate::error::SecurityFailure::InvalidToken))
/// from an unreachable platform
/// ([`Error::UpstreamUnavailable`](crate::error::Error::UpstreamUnavailable)).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Return the owning principal's name
    async fn resolve(&self, token: &str) -> Result<String>;
}

/// Source of the platform's project role bindings
#[async_trait]
pub trait RbacSource: Send + Sync {
    /// Fetch the complete current set of bindings
    async fn list_bindings(&self) -> Result<Vec<ProjectRoleBinding>>;

    /// Stream of change notifications; each item means "bindings changed"
    ///
    /// The default never yields, leaving refresh to the periodic timer.
    fn changes(&self) -> BoxStream<'static, ()> {
        Box::pin(futures::stream::pending())
    }
}
