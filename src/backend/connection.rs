//! A single multiplexed HTTP/2 connection to a backend.
//!
//! The connection's driver task owns the socket; this handle only carries
//! the request sender plus health and stream accounting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use hyper::client::conn::http2::SendRequest;

use crate::call::body::CallBody;

/// Non-owning description of where a call was forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRef {
    pub backend: String,
    pub connection_id: u64,
}

/// Pooled backend connection.
#[derive(Debug)]
pub struct BackendConnection {
    id: u64,
    backend: String,
    sender: SendRequest<CallBody>,
    healthy: Arc<AtomicBool>,
    open_streams: AtomicUsize,
    max_streams: usize,
}

impl BackendConnection {
    pub fn new(
        id: u64,
        backend: String,
        sender: SendRequest<CallBody>,
        healthy: Arc<AtomicBool>,
        max_streams: usize,
    ) -> Self {
        Self {
            id,
            backend,
            sender,
            healthy,
            open_streams: AtomicUsize::new(0),
            max_streams: max_streams.max(1),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn describe(&self) -> BackendRef {
        BackendRef {
            backend: self.backend.clone(),
            connection_id: self.id,
        }
    }

    /// Healthy until the driver exits, a request fails on it, or the peer
    /// closes it.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    pub fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::AcqRel) {
            tracing::debug!(backend = %self.backend, connection_id = self.id, "Backend connection marked unhealthy");
        }
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::Acquire)
    }

    /// Claim one stream slot if the connection is healthy and has capacity.
    pub fn try_reserve(self: &Arc<Self>) -> Option<StreamLease> {
        if !self.is_healthy() {
            return None;
        }
        self.open_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.max_streams).then_some(open + 1)
            })
            .ok()
            .map(|_| StreamLease {
                connection: Arc::clone(self),
            })
    }

    pub(crate) fn sender(&self) -> SendRequest<CallBody> {
        self.sender.clone()
    }
}

/// One stream slot on a backend connection, released on drop.
#[derive(Debug)]
pub struct StreamLease {
    connection: Arc<BackendConnection>,
}

impl StreamLease {
    pub fn connection(&self) -> &Arc<BackendConnection> {
        &self.connection
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.connection.open_streams.fetch_sub(1, Ordering::AcqRel);
    }
}
