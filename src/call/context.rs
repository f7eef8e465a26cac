//! Per-call context.
//!
//! A `CallContext` is owned by exactly one party at a time: the front-end
//! handler, then the coordinator, then (for forwarded calls) the response
//! relay. Whoever holds it last finishes it; dropping it unfinished records
//! the call as cancelled.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::BackendRef;
use crate::call::state::CallState;
use crate::error::GatewayError;
use crate::grpc::Code;
use crate::observability::metrics;
use crate::resilience::timeouts;

/// Unique call identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Byte counts and stream flags shared with the body wrappers.
#[derive(Debug, Default)]
pub struct CallCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    malformed: AtomicBool,
}

impl CallCounters {
    pub fn add_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// The caller stream broke framing after the first message.
    pub fn mark_malformed(&self) {
        self.malformed.store(true, Ordering::Relaxed);
    }

    pub fn is_malformed(&self) -> bool {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Count of calls that have not reached a terminal state.
#[derive(Debug, Clone, Default)]
pub struct ActiveCalls(Arc<AtomicUsize>);

impl ActiveCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveCallGuard {
        let active = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_calls(active);
        ActiveCallGuard(Arc::clone(&self.0))
    }
}

#[derive(Debug)]
struct ActiveCallGuard(Arc<AtomicUsize>);

impl Drop for ActiveCallGuard {
    fn drop(&mut self) {
        let active = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_calls(active);
    }
}

/// State of one in-flight call.
#[derive(Debug)]
pub struct CallContext {
    id: CallId,
    method: String,
    metadata: HeaderMap,
    peer: SocketAddr,
    started: Instant,
    deadline: Instant,
    state: CallState,
    counters: Arc<CallCounters>,
    backend: Option<BackendRef>,
    finished: bool,
    _active: ActiveCallGuard,
}

impl CallContext {
    pub fn new(
        method: impl Into<String>,
        metadata: HeaderMap,
        peer: SocketAddr,
        deadline: Instant,
        active: &ActiveCalls,
    ) -> Self {
        let call = Self {
            id: CallId::new(),
            method: method.into(),
            metadata,
            peer,
            started: Instant::now(),
            deadline,
            state: CallState::Received,
            counters: Arc::new(CallCounters::default()),
            backend: None,
            finished: false,
            _active: active.enter(),
        };
        tracing::debug!(call_id = %call.id, method = %call.method, peer = %call.peer, "Call received");
        call
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn metadata(&self) -> &HeaderMap {
        &self.metadata
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        timeouts::remaining(self.deadline)
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn counters(&self) -> Arc<CallCounters> {
        Arc::clone(&self.counters)
    }

    pub fn backend(&self) -> Option<&BackendRef> {
        self.backend.as_ref()
    }

    pub fn assign_backend(&mut self, backend: BackendRef) {
        self.backend = Some(backend);
    }

    /// Move to a non-terminal `next` state. Terminal states go through
    /// [`finish`](Self::finish).
    pub fn advance(&mut self, next: CallState) -> Result<(), GatewayError> {
        if next.is_terminal() || !self.state.can_transition_to(next) {
            return Err(GatewayError::Internal(format!(
                "illegal call transition {} -> {}",
                self.state, next
            )));
        }
        tracing::trace!(call_id = %self.id, from = %self.state, to = %next, "Call state");
        self.state = next;
        Ok(())
    }

    /// Reach a terminal state with the final status code.
    pub fn finish(mut self, state: CallState, code: Code) {
        self.complete(state, code);
    }

    fn complete(&mut self, state: CallState, code: Code) {
        if self.finished {
            return;
        }
        self.finished = true;

        let (state, code) = if state.is_terminal() && self.state.can_transition_to(state) {
            (state, code)
        } else {
            tracing::error!(
                call_id = %self.id,
                from = %self.state,
                to = %state,
                "Illegal terminal transition"
            );
            (CallState::Failed, Code::Internal)
        };
        self.state = state;

        let elapsed = self.started.elapsed();
        let backend = self.backend.as_ref().map(|b| b.backend.as_str()).unwrap_or("-");
        tracing::info!(
            call_id = %self.id,
            method = %self.method,
            state = %state,
            code = %code,
            backend,
            bytes_in = self.counters.bytes_in(),
            bytes_out = self.counters.bytes_out(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Call finished"
        );
        metrics::record_call(state.as_str(), code, elapsed);
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(call_id = %self.id, state = %self.state, "Call abandoned by caller");
            self.complete(CallState::Failed, Code::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(active: &ActiveCalls) -> CallContext {
        CallContext::new(
            "/echo.Echo/Say",
            HeaderMap::new(),
            "127.0.0.1:4000".parse().unwrap(),
            Instant::now() + Duration::from_secs(5),
            active,
        )
    }

    #[tokio::test]
    async fn test_advance_follows_table() {
        let active = ActiveCalls::new();
        let mut call = call(&active);
        call.advance(CallState::Extracting).unwrap();
        call.advance(CallState::AwaitingDecision).unwrap();
        assert!(matches!(
            call.advance(CallState::Received),
            Err(GatewayError::Internal(_))
        ));
        assert!(call.advance(CallState::Rejected).is_err());
        assert_eq!(call.state(), CallState::AwaitingDecision);
    }

    #[tokio::test]
    async fn test_active_count_released_on_finish_and_drop() {
        let active = ActiveCalls::new();
        let finished = call(&active);
        let dropped = call(&active);
        assert_eq!(active.count(), 2);

        finished.finish(CallState::Failed, Code::InvalidArgument);
        assert_eq!(active.count(), 1);
        drop(dropped);
        assert_eq!(active.count(), 0);
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let active = ActiveCalls::new();
        let call = call(&active);
        assert!(call.remaining() <= Duration::from_secs(5));
        assert!(call.remaining() > Duration::from_secs(4));
    }

    #[test]
    fn test_call_ids_unique() {
        assert_ne!(CallId::new(), CallId::new());
    }
}
