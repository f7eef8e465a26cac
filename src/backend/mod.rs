//! Backend connector subsystem.
//!
//! # Data Flow
//! ```text
//! Approved call
//!     → BackendManager::select (round_robin.rs, skipping open breakers)
//!     → pool.rs (reuse a connection with spare streams, or dial)
//!     → connector.rs (TCP → optional TLS → HTTP/2 handshake, keepalive)
//!     → connection.rs (stream lease held until the response stream ends)
//! ```
//!
//! # Design Decisions
//! - Connection health is tracked by the driver task, independent of breakers
//! - Forwarding is byte-transparent: bodies are streamed, never re-framed

pub mod connection;
pub mod connector;
pub mod pool;
pub mod round_robin;

use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::TlsConnector;

pub use connection::{BackendConnection, BackendRef, StreamLease};
pub use connector::{BackendTls, Connector};
pub use pool::{BackendPool, SendFailure, Sent};
pub use round_robin::RoundRobin;

use crate::config::GatewayConfig;
use crate::error::StartupError;
use crate::net::tls;

/// Every configured backend pool plus the selector across them.
#[derive(Debug)]
pub struct BackendManager {
    pools: Vec<Arc<BackendPool>>,
    balancer: RoundRobin,
}

impl BackendManager {
    pub fn new(pools: Vec<Arc<BackendPool>>) -> Self {
        Self {
            pools,
            balancer: RoundRobin::new(),
        }
    }

    /// Build one pool per configured backend.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, StartupError> {
        let client_tls = config.backend_tls.as_ref().map(tls::client_config).transpose()?;
        let connect_timeout = Duration::from_millis(config.timeouts.connect_ms);

        let mut pools = Vec::with_capacity(config.backends.len());
        for backend in &config.backends {
            let backend_tls = match &client_tls {
                Some(client_config) => {
                    let name = config
                        .backend_tls
                        .as_ref()
                        .and_then(|t| t.server_name.clone())
                        .unwrap_or_else(|| host_of(&backend.address).to_string());
                    Some(BackendTls {
                        connector: TlsConnector::from(Arc::clone(client_config)),
                        server_name: tls::server_name(&name)?,
                    })
                }
                None => None,
            };
            let connector = Connector::new(backend_tls, connect_timeout, config.pool.keepalive.clone());
            let pool = BackendPool::new(
                backend.name.clone(),
                backend.address.clone(),
                connector,
                backend.max_connections.unwrap_or(config.pool.max_connections_per_backend),
                config.pool.max_streams_per_connection,
            )?;
            tracing::info!(
                backend = %backend.name,
                address = %backend.address,
                tls = config.backend_tls.is_some(),
                "Backend pool configured"
            );
            pools.push(Arc::new(pool));
        }
        Ok(Self::new(pools))
    }

    /// Next backend, round-robin, among those `eligible` accepts.
    pub fn select(&self, eligible: impl FnMut(&Arc<BackendPool>) -> bool) -> Option<Arc<BackendPool>> {
        self.balancer.next(&self.pools, eligible).cloned()
    }

    pub fn pools(&self) -> &[Arc<BackendPool>] {
        &self.pools
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendPool>> {
        self.pools.iter().find(|p| p.name() == name).cloned()
    }
}

/// Host part of `host:port` (brackets stripped for IPv6 literals).
fn host_of(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, _port)) => host,
        None => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
