//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Caller-facing listener (bind address, TLS, connection limits).
    pub listener: ListenerConfig,

    /// Decision oracle settings.
    pub oracle: OracleConfig,

    /// Backend RPC servers. Calls are spread across them round-robin.
    pub backends: Vec<BackendConfig>,

    /// Backend connection pool settings.
    pub pool: PoolConfig,

    /// Optional TLS toward backends.
    pub backend_tls: Option<BackendTlsConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Circuit breaker configuration (applies to the oracle and every backend).
    pub circuit_breaker: CircuitBreakerConfig,

    /// Framing limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// Optional TLS configuration. Plaintext HTTP/2 (h2c) when absent.
    pub tls: Option<ListenerTlsConfig>,

    /// Maximum concurrent caller sessions (backpressure).
    pub max_connections: usize,

    /// TLS handshake timeout in milliseconds.
    pub handshake_timeout_ms: u64,

    /// How long to wait for sessions to drain on shutdown, in seconds.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8443".to_string(),
            tls: None,
            max_connections: 10_000,
            handshake_timeout_ms: 5_000,
            drain_timeout_secs: 15,
        }
    }
}

impl ListenerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerTlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// CA bundle used to verify caller certificates. When set, callers must
    /// present a certificate signed by one of these roots.
    pub client_ca_path: Option<String>,
}

/// Decision oracle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Full URL the decision request is POSTed to.
    pub endpoint: String,

    /// Per-exchange timeout in milliseconds.
    pub timeout_ms: u64,

    /// Caller metadata keys copied into the decision request.
    pub forwarded_metadata: Vec<String>,

    /// Metadata values longer than this are truncated.
    pub max_metadata_value_len: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/decide".to_string(),
            timeout_ms: 500,
            forwarded_metadata: vec![
                "user-agent".to_string(),
                "x-request-id".to_string(),
                "x-forwarded-for".to_string(),
            ],
            max_metadata_value_len: 256,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier, used for logs, metrics and breaker state.
    pub name: String,

    /// Backend address (e.g., "127.0.0.1:50051").
    pub address: String,

    /// Per-backend override of `pool.max_connections_per_backend`.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

/// Backend connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum physical connections per backend.
    pub max_connections_per_backend: usize,

    /// Maximum concurrent streams multiplexed on one connection.
    pub max_streams_per_connection: usize,

    /// HTTP/2 keepalive probing.
    pub keepalive: KeepaliveConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_backend: 4,
            max_streams_per_connection: 100,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

/// HTTP/2 PING keepalive settings for backend connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Interval between PINGs in seconds. Disabled when absent.
    pub interval_secs: Option<u64>,

    /// How long to wait for a PING ack before closing the connection.
    pub timeout_secs: u64,

    /// Send PINGs even when the connection has no open streams.
    pub while_idle: bool,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: Some(30),
            timeout_secs: 10,
            while_idle: false,
        }
    }
}

/// TLS settings toward backends.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendTlsConfig {
    /// CA bundle used to verify backend certificates (PEM).
    pub ca_path: String,

    /// Client certificate presented to backends (PEM).
    pub cert_path: Option<String>,

    /// Client private key (PEM).
    pub key_path: Option<String>,

    /// Name to verify in backend certificates. Defaults to the address host.
    pub server_name: Option<String>,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connection establishment timeout in milliseconds.
    pub connect_ms: u64,

    /// Deadline applied when the caller sends no `grpc-timeout`, in milliseconds.
    /// Also caps caller-supplied deadlines.
    pub default_deadline_ms: u64,

    /// Subtracted from every call deadline so the gateway answers before the
    /// caller gives up, in milliseconds.
    pub deadline_margin_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 2_000,
            default_deadline_ms: 30_000,
            deadline_margin_ms: 20,
        }
    }
}

/// Failure kinds a retry may be attempted for.
///
/// Oracle denials and rate limits have no variant here: they are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Backend connection refused, reset or closed before the call was sent.
    Connect,
    /// Backend connection establishment timed out.
    Timeout,
    /// Decision oracle unreachable, timed out or returned an unrecognized outcome.
    OracleError,
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Failure kinds that are retried.
    pub retry_on: Vec<RetryOn>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
            retry_on: vec![RetryOn::Connect, RetryOn::Timeout, RetryOn::OracleError],
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,

    /// How long an open breaker refuses calls, in milliseconds.
    pub cooldown_ms: u64,

    /// Trial calls admitted while half-open.
    pub half_open_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 10_000,
            half_open_trials: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Framing limits enforced on caller streams.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest length prefix accepted for a single message.
    pub max_message_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
