//! Credential extraction from inbound requests
//!
//! Never fails: a missing or malformed header degrades to "no credentials"
//! and the decision is left to the authorization step.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use crate::identity::Credentials;

const BASIC_SCHEME: &str = "basic";
const BEARER_SCHEME: &str = "bearer";

/// Everything authentication-relevant found on one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAuth {
    /// Basic credentials from the `Authorization` header
    pub credentials: Option<Credentials>,
    /// Username asserted by the fronting proxy
    pub claimed_user: Option<String>,
    /// Bearer token from the token header or `Authorization: Bearer`
    pub bearer_token: Option<String>,
    /// Transport-layer identity (certificate subject), passed through verbatim
    pub transport_identity: Option<String>,
}

/// Header names the extractor reads
#[derive(Debug, Clone)]
pub struct CredentialExtractor {
    user_header: String,
    token_header: String,
    transport_identity_header: String,
}

impl Default for CredentialExtractor {
    fn default() -> Self {
        Self::new(
            "x-proxy-remote-user",
            "x-forwarded-access-token",
            "x-ssl-client-subject",
        )
    }
}

impl CredentialExtractor {
    /// Create an extractor reading the given header names
    pub fn new(
        user_header: impl Into<String>,
        token_header: impl Into<String>,
        transport_identity_header: impl Into<String>,
    ) -> Self {
        Self {
            user_header: user_header.into().to_ascii_lowercase(),
            token_header: token_header.into().to_ascii_lowercase(),
            transport_identity_header: transport_identity_header.into().to_ascii_lowercase(),
        }
    }

    /// Collect credentials, claimed user, bearer token and transport identity
    pub fn extract(&self, headers: &HeaderMap) -> RequestAuth {
        let authorization = header_str(headers, AUTHORIZATION.as_str());

        let bearer_token = header_str(headers, &self.token_header)
            .map(str::to_string)
            .or_else(|| authorization.and_then(extract_bearer_token).map(str::to_string));

        RequestAuth {
            credentials: extract_credentials(authorization),
            claimed_user: header_str(headers, &self.user_header).map(str::to_string),
            bearer_token,
            transport_identity: header_str(headers, &self.transport_identity_header)
                .map(str::to_string),
        }
    }
}

/// Decode a `Basic base64(user:pass)` authorization value
///
/// The scheme is matched case-insensitively. Returns `None` when the header is
/// absent, uses another scheme, is not valid base64/UTF-8, lacks the `:`
/// separator, or carries an empty password.
pub fn extract_credentials(authorization: Option<&str>) -> Option<Credentials> {
    let value = authorization?;
    let (scheme, payload) = split_scheme(value)?;
    if !scheme.eq_ignore_ascii_case(BASIC_SCHEME) {
        debug!(scheme = %scheme, "Ignoring non-basic authorization scheme");
        return None;
    }

    let decoded = match STANDARD.decode(payload.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Basic authorization payload is not base64");
            return None;
        }
    };
    let decoded = match String::from_utf8(decoded) {
        Ok(s) => s,
        Err(_) => {
            debug!("Basic authorization payload is not UTF-8");
            return None;
        }
    };
    let decoded = decoded.trim_end_matches(['\r', '\n']);

    let Some((username, password)) = decoded.split_once(':') else {
        debug!("Basic authorization payload has no password separator");
        return None;
    };
    if username.is_empty() || password.is_empty() {
        debug!(username = %username, "Basic authorization payload has an empty field");
        return None;
    }

    Some(Credentials::new(username, password.as_bytes()))
}

/// Return the token of a `Bearer <token>` authorization value
pub fn extract_bearer_token(authorization: &str) -> Option<&str> {
    let (scheme, token) = split_scheme(authorization)?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case(BEARER_SCHEME) && !token.is_empty()).then_some(token)
}

fn split_scheme(value: &str) -> Option<(&str, &str)> {
    value.trim_start().split_once(' ')
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
