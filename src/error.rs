//! Error types shared across subsystems.

use thiserror::Error;

use crate::config::{ConfigError, RetryOn};
use crate::net::listener::ListenerError;
use crate::net::tls::TlsError;

/// Everything that can end a call on the gateway's side.
///
/// Backend-originated statuses never become a `GatewayError`; they are
/// relayed as-is. `grpc::mapper` turns each variant into the caller-visible
/// status.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("malformed call: {0}")]
    Malformed(String),

    #[error("denied by decision service")]
    Denied(Option<String>),

    #[error("rate limited by decision service")]
    RateLimited(Option<String>),

    #[error("decision service unavailable: {0}")]
    OracleUnavailable(String),

    #[error("circuit open for {target}")]
    CircuitOpen { target: String },

    #[error("backend {backend} unreachable: {reason}")]
    BackendUnreachable { backend: String, reason: String },

    #[error("connecting to backend {backend} timed out")]
    ConnectTimeout { backend: String },

    #[error("backend {backend} has no stream capacity left")]
    PoolExhausted { backend: String },

    #[error("backend {backend} failed the call: {reason}")]
    BackendStream { backend: String, reason: String },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("call cancelled by caller: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Retry class of this failure, if it is transient at all.
    pub fn retry_kind(&self) -> Option<RetryOn> {
        match self {
            GatewayError::BackendUnreachable { .. } => Some(RetryOn::Connect),
            GatewayError::ConnectTimeout { .. } => Some(RetryOn::Timeout),
            GatewayError::OracleUnavailable(_) => Some(RetryOn::OracleError),
            _ => None,
        }
    }

    /// Whether this failure says something about the backend's health and
    /// should count against its circuit breaker.
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            GatewayError::BackendUnreachable { .. }
                | GatewayError::ConnectTimeout { .. }
                | GatewayError::BackendStream { .. }
        )
    }
}

/// Failures while assembling the gateway at startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("decision client setup failed: {0}")]
    DecisionClient(#[from] reqwest::Error),

    #[error("invalid backend address `{address}`: {reason}")]
    Backend { address: String, reason: String },

    #[error(transparent)]
    Listener(#[from] ListenerError),
}
