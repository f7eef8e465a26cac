//! Deadline budgeting.
//!
//! Every call gets one absolute deadline when it arrives. All later work
//! (decision, connect, forwarding) runs against what is left of it, never
//! against a fresh timer.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::{GatewayConfig, TimeoutConfig};

/// Timeout settings resolved from config.
#[derive(Debug, Clone, Copy)]
pub struct CallTimeouts {
    /// Used when the caller sends no `grpc-timeout`, and as an upper bound when it does.
    pub default_deadline: Duration,
    /// Subtracted from the caller's budget so our status arrives before the caller gives up.
    pub margin: Duration,
    pub decision: Duration,
    pub connect: Duration,
}

impl CallTimeouts {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let TimeoutConfig {
            connect_ms,
            default_deadline_ms,
            deadline_margin_ms,
        } = config.timeouts;
        Self {
            default_deadline: Duration::from_millis(default_deadline_ms),
            margin: Duration::from_millis(deadline_margin_ms),
            decision: config.oracle.timeout(),
            connect: Duration::from_millis(connect_ms),
        }
    }

    /// Absolute deadline for a call that arrived at `now`.
    pub fn deadline_for(&self, now: Instant, requested: Option<Duration>) -> Instant {
        let budget = requested
            .map_or(self.default_deadline, |requested| requested.min(self.default_deadline))
            .saturating_sub(self.margin);
        now + budget
    }
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// Time left until `deadline`, zero once it has passed.
pub fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
