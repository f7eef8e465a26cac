//! Dialing backends: TCP, optional TLS, then the HTTP/2 handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::call::body::CallBody;
use crate::config::KeepaliveConfig;
use crate::error::GatewayError;

/// TLS settings for one backend.
#[derive(Clone)]
pub struct BackendTls {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for BackendTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// A freshly established connection.
#[derive(Debug)]
pub struct Dialed {
    pub sender: SendRequest<CallBody>,
    pub healthy: Arc<AtomicBool>,
}

/// Opens connections to one backend address.
#[derive(Debug, Clone)]
pub struct Connector {
    tls: Option<BackendTls>,
    connect_timeout: Duration,
    keepalive: KeepaliveConfig,
}

impl Connector {
    pub fn new(tls: Option<BackendTls>, connect_timeout: Duration, keepalive: KeepaliveConfig) -> Self {
        Self {
            tls,
            connect_timeout,
            keepalive,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Dial `address`, bounded by the connect timeout (TCP, TLS and HTTP/2
    /// handshake together).
    pub async fn connect(&self, backend: &str, address: &str) -> Result<Dialed, GatewayError> {
        match tokio::time::timeout(self.connect_timeout, self.dial(backend, address)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::ConnectTimeout {
                backend: backend.to_string(),
            }),
        }
    }

    async fn dial(&self, backend: &str, address: &str) -> Result<Dialed, GatewayError> {
        let unreachable = |reason: String| GatewayError::BackendUnreachable {
            backend: backend.to_string(),
            reason,
        };

        let tcp = TcpStream::connect(address)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!(backend, error = %e, "Failed to set TCP_NODELAY");
        }

        match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), tcp)
                    .await
                    .map_err(|e| unreachable(format!("TLS handshake: {e}")))?;
                self.handshake(backend, stream).await.map_err(unreachable)
            }
            None => self.handshake(backend, tcp).await.map_err(unreachable),
        }
    }

    async fn handshake<S>(&self, backend: &str, stream: S) -> Result<Dialed, String>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut builder = http2::Builder::new(TokioExecutor::new());
        builder.timer(TokioTimer::new());
        if let Some(interval) = self.keepalive.interval_secs {
            builder
                .keep_alive_interval(Duration::from_secs(interval))
                .keep_alive_timeout(Duration::from_secs(self.keepalive.timeout_secs))
                .keep_alive_while_idle(self.keepalive.while_idle);
        }

        let (sender, connection) = builder
            .handshake::<_, CallBody>(TokioIo::new(stream))
            .await
            .map_err(|e| format!("HTTP/2 handshake: {e}"))?;

        let healthy = Arc::new(AtomicBool::new(true));
        let driver_healthy = Arc::clone(&healthy);
        let backend = backend.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(backend = %backend, error = %e, "Backend connection closed with error");
            }
            driver_healthy.store(false, Ordering::Release);
        });

        Ok(Dialed { sender, healthy })
    }
}
