//! Identity types shared by the authentication backends

use std::fmt;

use serde::{Deserialize, Serialize};

/// Username/secret pair recovered from a request
///
/// Equality covers both fields. The secret is redacted from `Debug` output
/// and is never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    secret: Vec<u8>,
}

impl Credentials {
    /// Create credentials from a username and raw secret bytes
    pub fn new(username: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// Claimed username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Raw secret bytes
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Backend that vouched for an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySource {
    /// Bearer token resolved by the orchestration platform
    Dynamic,
    /// File-sourced static credential table
    Static,
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentitySource::Dynamic => f.write_str("dynamic"),
            IdentitySource::Static => f.write_str("static"),
        }
    }
}

/// Outcome of successful authentication; carries no secret material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedIdentity {
    /// Principal name
    pub username: String,
    /// Backend that authenticated the principal
    pub source: IdentitySource,
    /// Role names usable for role-based access rules
    #[serde(default)]
    pub roles: Vec<String>,
}

impl AuthenticatedIdentity {
    /// Identity resolved by the orchestration platform
    pub fn dynamic(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            source: IdentitySource::Dynamic,
            roles: Vec::new(),
        }
    }

    /// Identity from the static credential table
    pub fn from_static(username: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            username: username.into(),
            source: IdentitySource::Static,
            roles,
        }
    }
}
