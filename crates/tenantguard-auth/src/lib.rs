//! TenantGuard
//!
//! Authentication and authorization layer between a Kubernetes-style
//! orchestration platform and a multi-tenant search engine.
//!
//! # Architecture
//!
//! ```text
//! request ──► CredentialExtractor ──► TokenOwnershipVerifier ──┐
//!                                 └─► FileAuthenticationBackend ┴─► AccessDecisionPoint ──► allow/deny
//!                                                                          │
//! platform RBAC ──► PolicyCache ──► AclSynchronizer ──► RuleStore ◄────────┘
//! ```
//!
//! # Endpoints
//!
//! - `GET /authorize?index=<pattern>` - Forward-auth decision
//! - `GET /healthz` - `ok` while policy data is fresh, `503 stale` otherwise

#![deny(missing_docs)]

pub mod acl;
pub mod config;
pub mod credentials;
pub mod decision;
pub mod error;
pub mod file_auth;
pub mod identity;
pub mod platform;
pub mod policy_cache;
pub mod server;
pub mod token_auth;

pub use acl::{AccessRule, AclDocument, AclSynchronizer, RuleStore};
pub use credentials::CredentialExtractor;
pub use decision::{AccessDecisionPoint, AccessGrant, AuthOrder};
pub use error::{Error, Result, SecurityFailure};
pub use file_auth::FileAuthenticationBackend;
pub use identity::{AuthenticatedIdentity, Credentials, IdentitySource};
pub use policy_cache::{CacheState, PolicyCache, PolicySnapshot};
pub use token_auth::TokenOwnershipVerifier;
