use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error kinds surfaced by the gateway core.
///
/// `ConfigInvalid` and `Conflict` are rejected at the admin boundary and
/// leave state unchanged. `Upstream` and `Timeout` are converted into 502
/// and 504 responses on the proxy path, each paired with exactly one
/// recorded measurement.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("bad upstream response: {0}")]
    BadResponse(String),

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}
