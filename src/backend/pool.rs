//! Connection pool for one backend.
//!
//! # Selection
//! 1. Reuse a healthy connection with spare stream capacity
//! 2. Otherwise wait on an in-flight dial that will have a stream to spare
//! 3. Otherwise dial, if live + in-flight dials stay under the bound
//! 4. Otherwise fail with `PoolExhausted`
//!
//! The pool mutex guards membership only and is never held across a dial
//! or a request.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::http::uri::{Authority, Scheme};
use axum::http::{Request, Response, Uri};
use hyper::body::Incoming;
use tokio::sync::Notify;

use crate::backend::connection::{BackendConnection, StreamLease};
use crate::backend::connector::Connector;
use crate::call::body::CallBody;
use crate::error::{GatewayError, StartupError};

#[derive(Debug, Default)]
struct PoolState {
    connections: Vec<Arc<BackendConnection>>,
    /// Dials in flight; each one's dialer holds the first stream.
    dialing: usize,
    /// Callers parked on an in-flight dial.
    waiting: usize,
    dial_failures: u64,
    last_dial_error: Option<GatewayError>,
}

impl PoolState {
    /// Streams the in-flight dials will have left over for waiters.
    fn promised_streams(&self, max_streams: usize) -> usize {
        (self.dialing * max_streams.saturating_sub(1)).saturating_sub(self.waiting)
    }
}

/// A response from the backend plus the stream slot it occupies.
#[derive(Debug)]
pub struct Sent {
    pub response: Response<Incoming>,
    pub lease: StreamLease,
}

/// A failed attempt. `request` is returned when it never reached the
/// backend, so the attempt can be retried.
#[derive(Debug)]
pub struct SendFailure {
    pub error: GatewayError,
    pub request: Option<Request<CallBody>>,
}

/// Connections to a single named backend.
#[derive(Debug)]
pub struct BackendPool {
    name: String,
    address: String,
    scheme: Scheme,
    authority: Authority,
    connector: Connector,
    max_connections: usize,
    max_streams: usize,
    state: Mutex<PoolState>,
    dial_done: Notify,
    next_connection_id: AtomicU64,
    connect_attempts: AtomicU64,
}

impl BackendPool {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        connector: Connector,
        max_connections: usize,
        max_streams: usize,
    ) -> Result<Self, StartupError> {
        let address = address.into();
        let authority = Authority::from_str(&address).map_err(|e| StartupError::Backend {
            address: address.clone(),
            reason: e.to_string(),
        })?;
        let scheme = if connector.is_tls() { Scheme::HTTPS } else { Scheme::HTTP };
        Ok(Self {
            name: name.into(),
            address,
            scheme,
            authority,
            connector,
            max_connections: max_connections.max(1),
            max_streams: max_streams.max(1),
            state: Mutex::new(PoolState::default()),
            dial_done: Notify::new(),
            next_connection_id: AtomicU64::new(1),
            connect_attempts: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live connections currently in the pool.
    pub fn connection_count(&self) -> usize {
        let mut state = self.lock();
        state.connections.retain(|c| c.is_healthy());
        state.connections.len()
    }

    /// Streams open across every connection.
    pub fn open_streams(&self) -> usize {
        self.lock().connections.iter().map(|c| c.open_streams()).sum()
    }

    /// Dials started since the pool was created, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Get a stream slot, dialing a new connection only when needed.
    ///
    /// Callers arriving while a dial is in flight wait for it as long as the
    /// new connection will have a stream left for them. If that dial fails,
    /// they fail with the same error instead of dialing again.
    pub async fn acquire(&self) -> Result<StreamLease, GatewayError> {
        let mut seen_failures = None;
        loop {
            let dial_done = {
                let mut state = self.lock();
                state.connections.retain(|c| c.is_healthy());
                if let Some(lease) = state.connections.iter().find_map(|c| c.try_reserve()) {
                    return Ok(lease);
                }
                if let (Some(seen), Some(error)) = (seen_failures, &state.last_dial_error) {
                    if state.dial_failures != seen {
                        return Err(error.clone());
                    }
                }
                if state.promised_streams(self.max_streams) > 0 {
                    state.waiting += 1;
                    seen_failures = Some(state.dial_failures);
                    self.dial_done.notified()
                } else if state.connections.len() + state.dialing < self.max_connections {
                    state.dialing += 1;
                    break;
                } else {
                    return Err(GatewayError::PoolExhausted {
                        backend: self.name.clone(),
                    });
                }
            };
            let _waiting = WaitSlot { pool: self };
            dial_done.await;
        }
        self.dial().await
    }

    /// Dial one connection. The caller has already counted it in `dialing`.
    async fn dial(&self) -> Result<StreamLease, GatewayError> {
        let slot = DialSlot { pool: self, armed: true };
        let attempt = self.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(backend = %self.name, address = %self.address, attempt, "Dialing backend");

        let dialed = match self.connector.connect(&self.name, &self.address).await {
            Ok(dialed) => dialed,
            Err(error) => {
                slot.fail(&error);
                return Err(error);
            }
        };
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(BackendConnection::new(
            id,
            self.name.clone(),
            dialed.sender,
            dialed.healthy,
            self.max_streams,
        ));
        let lease = connection.try_reserve().ok_or_else(|| GatewayError::BackendStream {
            backend: self.name.clone(),
            reason: "connection closed right after handshake".to_string(),
        });

        slot.complete(connection);
        tracing::info!(backend = %self.name, connection_id = id, "Backend connection established");
        lease
    }

    /// Send `request` on a pooled stream.
    pub async fn send(&self, request: Request<CallBody>) -> Result<Sent, SendFailure> {
        let lease = match self.acquire().await {
            Ok(lease) => lease,
            Err(error) => {
                return Err(SendFailure {
                    error,
                    request: Some(request),
                })
            }
        };

        let request = self.target(request);
        let mut sender = lease.connection().sender();
        match sender.try_send_request(request).await {
            Ok(response) => Ok(Sent { response, lease }),
            Err(mut e) => {
                let request = e.take_message();
                let error = self.send_error(lease.connection(), sender.is_closed(), request.is_some(), e.into_error().to_string());
                Err(SendFailure { error, request })
            }
        }
    }

    /// Classify a failed send. Only a closed sender takes the connection out
    /// of rotation; a request handed back unsent is retryable on its own.
    fn send_error(
        &self,
        connection: &BackendConnection,
        closed: bool,
        unsent: bool,
        reason: String,
    ) -> GatewayError {
        if closed {
            connection.mark_unhealthy();
        }
        if unsent {
            GatewayError::BackendUnreachable {
                backend: self.name.clone(),
                reason,
            }
        } else {
            GatewayError::BackendStream {
                backend: self.name.clone(),
                reason,
            }
        }
    }

    /// Point the request at this backend, keeping path and query.
    fn target(&self, request: Request<CallBody>) -> Request<CallBody> {
        let (mut parts, body) = request.into_parts();
        let mut uri_parts = parts.uri.clone().into_parts();
        uri_parts.scheme = Some(self.scheme.clone());
        uri_parts.authority = Some(self.authority.clone());
        if let Ok(uri) = Uri::from_parts(uri_parts) {
            parts.uri = uri;
        }
        Request::from_parts(parts, body)
    }
}

/// Counts an in-flight dial against the pool bound until it completes or
/// fails. Waiters are woken either way, including when the dial is dropped.
struct DialSlot<'a> {
    pool: &'a BackendPool,
    armed: bool,
}

impl DialSlot<'_> {
    fn complete(mut self, connection: Arc<BackendConnection>) {
        {
            let mut state = self.pool.lock();
            state.dialing = state.dialing.saturating_sub(1);
            state.connections.push(connection);
        }
        self.armed = false;
        self.pool.dial_done.notify_waiters();
    }

    fn fail(mut self, error: &GatewayError) {
        {
            let mut state = self.pool.lock();
            state.dialing = state.dialing.saturating_sub(1);
            state.dial_failures += 1;
            state.last_dial_error = Some(error.clone());
        }
        self.armed = false;
        self.pool.dial_done.notify_waiters();
    }
}

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.pool.lock();
                state.dialing = state.dialing.saturating_sub(1);
            }
            self.pool.dial_done.notify_waiters();
        }
    }
}

/// A caller parked on an in-flight dial.
struct WaitSlot<'a> {
    pool: &'a BackendPool,
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }
}
