//! Configuration validation.
//!
//! Serde handles syntax; this module checks semantics (value ranges,
//! parseable addresses, consistent TLS material). All problems are collected
//! so one run reports everything wrong with a file.

use std::collections::HashSet;
use std::net::SocketAddr;

use axum::http::uri::Authority;
use thiserror::Error;

use crate::config::schema::GatewayConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address `{0}` is not a socket address")]
    BindAddress(String),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("oracle.endpoint `{endpoint}` is not a valid http(s) URL")]
    OracleEndpoint { endpoint: String },
    #[error("at least one backend must be configured")]
    NoBackends,
    #[error("backend `{name}` has invalid address `{address}`")]
    BackendAddress { name: String, address: String },
    #[error("backend name `{0}` is used more than once")]
    DuplicateBackend(String),
    #[error("backend_tls.cert_path and backend_tls.key_path must be set together")]
    IncompleteClientCert,
    #[error("retries.base_delay_ms must not exceed retries.max_delay_ms")]
    BackoffRange,
    #[error("observability.metrics_address `{0}` is not a socket address")]
    MetricsAddress(String),
    #[error("forwarded metadata key `{0}` is not a valid lowercase header name")]
    MetadataKey(String),
}

/// Validate a parsed configuration, returning every problem found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }
    require_positive(&mut errors, "listener.max_connections", config.listener.max_connections as u64);

    match url::Url::parse(&config.oracle.endpoint) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => {}
        _ => errors.push(ValidationError::OracleEndpoint {
            endpoint: config.oracle.endpoint.clone(),
        }),
    }
    require_positive(&mut errors, "oracle.timeout_ms", config.oracle.timeout_ms);
    for key in &config.oracle.forwarded_metadata {
        let valid = axum::http::HeaderName::from_bytes(key.as_bytes()).is_ok()
            && key.chars().all(|c| !c.is_ascii_uppercase());
        if !valid {
            errors.push(ValidationError::MetadataKey(key.clone()));
        }
    }

    if config.backends.is_empty() {
        errors.push(ValidationError::NoBackends);
    }
    let mut names = HashSet::new();
    for backend in &config.backends {
        if !names.insert(backend.name.as_str()) {
            errors.push(ValidationError::DuplicateBackend(backend.name.clone()));
        }
        let has_port = backend
            .address
            .parse::<Authority>()
            .map(|authority| authority.port_u16().is_some())
            .unwrap_or(false);
        if !has_port {
            errors.push(ValidationError::BackendAddress {
                name: backend.name.clone(),
                address: backend.address.clone(),
            });
        }
        if backend.max_connections == Some(0) {
            errors.push(ValidationError::Zero {
                field: "backends.max_connections",
            });
        }
    }

    require_positive(
        &mut errors,
        "pool.max_connections_per_backend",
        config.pool.max_connections_per_backend as u64,
    );
    require_positive(
        &mut errors,
        "pool.max_streams_per_connection",
        config.pool.max_streams_per_connection as u64,
    );
    if let Some(tls) = &config.backend_tls {
        if tls.cert_path.is_some() != tls.key_path.is_some() {
            errors.push(ValidationError::IncompleteClientCert);
        }
    }

    require_positive(&mut errors, "timeouts.connect_ms", config.timeouts.connect_ms);
    require_positive(&mut errors, "timeouts.default_deadline_ms", config.timeouts.default_deadline_ms);

    require_positive(&mut errors, "retries.max_attempts", config.retries.max_attempts as u64);
    if config.retries.base_delay_ms > config.retries.max_delay_ms {
        errors.push(ValidationError::BackoffRange);
    }

    require_positive(
        &mut errors,
        "circuit_breaker.failure_threshold",
        config.circuit_breaker.failure_threshold as u64,
    );
    require_positive(
        &mut errors,
        "circuit_breaker.half_open_trials",
        config.circuit_breaker.half_open_trials as u64,
    );

    require_positive(&mut errors, "limits.max_message_bytes", config.limits.max_message_bytes as u64);

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn require_positive(errors: &mut Vec<ValidationError>, field: &'static str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::Zero { field });
    }
}
