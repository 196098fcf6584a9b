//! Decision sidecar HTTP server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::decision::AccessDecisionPoint;
use crate::error::Error;
use crate::policy_cache::PolicyCache;

/// Response header naming the allowed principal
pub const USER_RESPONSE_HEADER: &str = "x-tenantguard-user";

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Authentication and authorization
    pub decision: Arc<AccessDecisionPoint>,
    /// Policy cache, for health
    pub cache: Arc<PolicyCache>,
}

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    index: String,
}

/// Build the sidecar routes
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/authorize", get(authorize_handler))
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn start_server(
    addr: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("cannot bind {}: {}", addr, e)))?;

    info!(addr = %addr, "Starting decision server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Server error: {}", e)))
}

async fn healthz_handler(State(state): State<AppState>) -> Response {
    if state.cache.is_stale() {
        (StatusCode::SERVICE_UNAVAILABLE, "stale").into_response()
    } else {
        (StatusCode::OK, "ok").into_response()
    }
}

async fn authorize_handler(
    State(state): State<AppState>,
    Query(params): Query<AuthorizeParams>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let source_host = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim);

    let grant = state
        .decision
        .decide(&headers, source_host, &params.index)
        .await?;

    let user = HeaderValue::from_str(&grant.identity.username)
        .map_err(|e| Error::Internal(format!("username is not a valid header value: {}", e)))?;
    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert(USER_RESPONSE_HEADER, user);
    Ok(response)
}
