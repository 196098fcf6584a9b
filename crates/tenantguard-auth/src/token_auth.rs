//! Token ownership verification
//!
//! A claimed username is never trusted on its own. The bearer token is
//! resolved by the orchestration platform and the resolved owner must equal
//! the claimed name exactly (case-sensitive). This closes both the
//! "admin without a token" and the "foo presenting admin's token" holes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::{Error, Result, SecurityFailure};
use crate::identity::AuthenticatedIdentity;
use crate::platform::IdentityResolver;

/// Default bound on a single identity resolution call
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Verifies that a bearer token belongs to the user it is presented for
pub struct TokenOwnershipVerifier {
    resolver: Arc<dyn IdentityResolver>,
    timeout: Duration,
}

impl TokenOwnershipVerifier {
    /// Create a verifier with the default timeout
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self::with_timeout(resolver, DEFAULT_VERIFY_TIMEOUT)
    }

    /// Create a verifier with an explicit upstream timeout
    pub fn with_timeout(resolver: Arc<dyn IdentityResolver>, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    /// Verify that `token` resolves to `claimed_username`
    ///
    /// - no token: [`SecurityFailure::MissingToken`]
    /// - platform rejects the token: [`SecurityFailure::InvalidToken`]
    /// - platform unreachable or slow: [`Error::UpstreamUnavailable`]
    /// - resolved owner differs: [`SecurityFailure::TokenMismatch`]
    #[instrument(skip(self, token), fields(claimed = %claimed_username))]
    pub async fn verify(
        &self,
        claimed_username: &str,
        token: Option<&str>,
    ) -> Result<AuthenticatedIdentity> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            warn!(claimed = %claimed_username, "Username claimed without a bearer token");
            return Err(SecurityFailure::MissingToken.into());
        };

        let owner = self.resolve(token).await?;
        if owner != claimed_username {
            warn!(
                claimed = %claimed_username,
                resolved = %owner,
                "Bearer token does not belong to claimed user"
            );
            return Err(SecurityFailure::TokenMismatch.into());
        }

        debug!(username = %owner, "Token ownership verified");
        Ok(AuthenticatedIdentity::dynamic(owner))
    }

    /// Authenticate a bare bearer token as whoever the platform says owns it
    #[instrument(skip_all)]
    pub async fn authenticate_token(&self, token: &str) -> Result<AuthenticatedIdentity> {
        if token.is_empty() {
            return Err(SecurityFailure::MissingToken.into());
        }
        let owner = self.resolve(token).await?;
        debug!(username = %owner, "Bearer token authenticated");
        Ok(AuthenticatedIdentity::dynamic(owner))
    }

    async fn resolve(&self, token: &str) -> Result<String> {
        match tokio::time::timeout(self.timeout, self.resolver.resolve(token)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Identity resolution timed out");
                Err(Error::UpstreamUnavailable(format!(
                    "identity resolution timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}
