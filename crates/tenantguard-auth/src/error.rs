//! Error types for authentication, authorization and policy synchronization

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for tenantguard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a presented identity was rejected
///
/// Every variant is an expected, per-request outcome: the request is denied
/// and never retried against another backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityFailure {
    /// Username is not present in the static credential table
    #[error("unknown user")]
    UnknownUser,
    /// Username is known but the secret does not match
    #[error("bad credentials")]
    BadCredentials,
    /// The bearer token resolved to a different identity than the one claimed
    #[error("token does not belong to claimed user")]
    TokenMismatch,
    /// A username was claimed without a bearer token to back it
    #[error("missing bearer token")]
    MissingToken,
    /// The platform rejected the token (expired, revoked, malformed)
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// The request carried nothing to authenticate with
    #[error("no credentials")]
    NoCredentials,
}

/// Error type for tenantguard operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fatal misconfiguration, only raised while constructing components
    #[error("configuration error: {0}")]
    Config(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    Security(#[from] SecurityFailure),

    /// Authenticated, but no access rule grants the requested index
    #[error("authorization failed: {0}")]
    Forbidden(String),

    /// The orchestration platform could not be reached or timed out
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The rule list changed between read and commit
    #[error("rule list conflict: expected version {expected}, found {found}")]
    Conflict {
        /// Version the writer read
        expected: u64,
        /// Version currently stored
        found: u64,
    },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for transient upstream failures, the only errors that may fall back
    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(self, Error::UpstreamUnavailable(_))
    }

    /// True when the request presented a wrong or missing identity
    pub fn is_security_failure(&self) -> bool {
        matches!(self, Error::Security(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::Security(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) | Error::Conflict { .. } | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "status": status.as_u16(),
            "error": {
                "type": match &self {
                    Error::Security(_) => "security_exception",
                    Error::Forbidden(_) => "security_exception",
                    Error::UpstreamUnavailable(_) => "unavailable_exception",
                    _ => "internal_exception",
                },
                "reason": self.to_string(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::UpstreamUnavailable(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
