//! HTTP/2 front end.
//!
//! # Responsibilities
//! - Accept caller sessions (connection limit, optional mutual TLS)
//! - Serve HTTP/2 on each session and route every path to the call handler
//! - Validate the call head and first message before the coordinator runs
//! - Drain sessions with GOAWAY on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, Response},
    Router,
};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::call::coordinator::reject;
use crate::call::{CallBody, CallContext, Coordinator, PeekError};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, StartupError};
use crate::grpc::mapper::error_status;
use crate::http::request::{parse_head, HeadError};
use crate::http::response::{status_response, unsupported_media_type};
use crate::net::{tls, ConnectionTracker, Listener, ListenerError};
use crate::resilience::CallTimeouts;

/// State injected into the call handler.
#[derive(Clone)]
pub struct FrontEndState {
    pub coordinator: Arc<Coordinator>,
    pub timeouts: CallTimeouts,
    pub max_message_bytes: usize,
}

/// The gateway's caller-facing server.
pub struct GatewayServer {
    router: Router,
    tls: Option<TlsAcceptor>,
    coordinator: Arc<Coordinator>,
    sessions: ConnectionTracker,
    handshake_timeout: Duration,
    drain_timeout: Duration,
}

impl GatewayServer {
    /// Build every subsystem from configuration.
    pub fn new(config: &GatewayConfig) -> Result<Self, StartupError> {
        let coordinator = Arc::new(Coordinator::from_config(config)?);
        Self::with_coordinator(config, coordinator)
    }

    /// Build around an existing coordinator.
    pub fn with_coordinator(config: &GatewayConfig, coordinator: Arc<Coordinator>) -> Result<Self, StartupError> {
        let tls = match &config.listener.tls {
            Some(tls_config) => Some(TlsAcceptor::from(tls::server_config(tls_config)?)),
            None => None,
        };

        let state = FrontEndState {
            coordinator: Arc::clone(&coordinator),
            timeouts: *coordinator.timeouts(),
            max_message_bytes: config.limits.max_message_bytes,
        };

        Ok(Self {
            router: Self::build_router(state),
            tls,
            coordinator,
            sessions: ConnectionTracker::new(),
            handshake_timeout: config.listener.handshake_timeout(),
            drain_timeout: config.listener.drain_timeout(),
        })
    }

    /// Every path is a method name; there are no fixed routes.
    fn build_router(state: FrontEndState) -> Router {
        Router::new()
            .fallback(handle_call)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn sessions(&self) -> &ConnectionTracker {
        &self.sessions
    }

    /// Accept sessions until `shutdown` fires, then drain.
    pub async fn run(self, listener: Listener, mut shutdown: broadcast::Receiver<()>) -> Result<(), ListenerError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(address = %addr, tls = self.tls.is_some(), "Gateway listening");
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let session = Session {
                            router: self.router.clone(),
                            tls: self.tls.clone(),
                            handshake_timeout: self.handshake_timeout,
                            peer,
                        };
                        let guard = self.sessions.track();
                        let session_shutdown = shutdown.resubscribe();
                        tokio::spawn(async move {
                            let _permit = permit;
                            let _guard = guard;
                            session.run(stream, session_shutdown).await;
                        });
                    }
                    Err(ListenerError::Accept(e)) => {
                        // Usually fd exhaustion; back off instead of spinning.
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        drop(listener);
        tracing::info!(sessions = self.sessions.active_count(), "Draining sessions");
        if self.sessions.drain(self.drain_timeout).await {
            tracing::info!("All sessions drained");
        } else {
            tracing::warn!(
                sessions = self.sessions.active_count(),
                "Drain timeout elapsed with sessions still open"
            );
        }
        Ok(())
    }
}

struct Session {
    router: Router,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    peer: SocketAddr,
}

impl Session {
    async fn run(self, stream: tokio::net::TcpStream, shutdown: broadcast::Receiver<()>) {
        let Some(acceptor) = self.tls.clone() else {
            self.serve(stream, shutdown).await;
            return;
        };
        match tokio::time::timeout(self.handshake_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => self.serve(tls_stream, shutdown).await,
            Ok(Err(e)) => tracing::debug!(peer = %self.peer, error = %e, "TLS handshake failed"),
            Err(_) => tracing::debug!(peer = %self.peer, "TLS handshake timed out"),
        }
    }

    async fn serve<S>(self, io: S, mut shutdown: broadcast::Receiver<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = self.peer;
        let router = self.router;
        let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
            request.extensions_mut().insert(ConnectInfo(peer));
            router.clone().oneshot(request)
        });

        let mut builder = hyper::server::conn::http2::Builder::new(TokioExecutor::new());
        builder.timer(TokioTimer::new());
        let connection = builder.serve_connection(TokioIo::new(io), service);
        tokio::pin!(connection);

        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(peer = %peer, error = %e, "Session ended with error");
                }
            }
            _ = shutdown.recv() => {
                connection.as_mut().graceful_shutdown();
                if let Err(e) = connection.await {
                    tracing::debug!(peer = %peer, error = %e, "Session ended with error during drain");
                }
            }
        }
    }
}

/// Entry point for every call.
async fn handle_call(
    State(state): State<FrontEndState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    let (parts, body) = request.into_parts();

    let head = match parse_head(&parts) {
        Ok(head) => head,
        Err(HeadError::NotGrpc(content_type)) => {
            tracing::debug!(peer = %peer, content_type = %content_type, "Non-gRPC request refused");
            return unsupported_media_type();
        }
        Err(HeadError::Malformed(reason)) => {
            tracing::debug!(peer = %peer, reason = %reason, "Malformed call head");
            return status_response(&error_status(&GatewayError::Malformed(reason)));
        }
    };

    let deadline = state.timeouts.deadline_for(Instant::now(), head.timeout);
    let call = CallContext::new(
        head.method,
        parts.headers.clone(),
        peer,
        deadline,
        state.coordinator.active_calls(),
    );

    let peeked = tokio::time::timeout_at(
        deadline,
        CallBody::peek(body, state.max_message_bytes, call.counters()),
    )
    .await;
    let body = match peeked {
        Ok(Ok(body)) => body,
        Ok(Err(PeekError::Malformed(e))) => return reject(call, GatewayError::Malformed(e.to_string())),
        Ok(Err(PeekError::Caller(e))) => return reject(call, GatewayError::Cancelled(e.to_string())),
        Err(_) => return reject(call, GatewayError::DeadlineExceeded),
    };

    state.coordinator.handle(call, parts, body).await
}
