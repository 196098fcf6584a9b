//! Shared plumbing for tenantguard binaries and libraries
//!
//! - [`telemetry`]: structured logging setup
//! - [`metrics`]: OpenTelemetry instruments for auth decisions, policy refresh and ACL sync
//! - [`retry`]: bounded exponential backoff for calls to the orchestration platform

#![deny(missing_docs)]

pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use retry::{retry_with_backoff, RetryConfig};
