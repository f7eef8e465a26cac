//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call arrives
//!     → timeouts.rs (one absolute deadline for the whole call)
//! Decision / backend attempt:
//!     → circuit_breaker.rs (fail fast while the target is open)
//!     → On transient failure: retries.rs (retry_on + attempts left?)
//!         → backoff.rs (exponential delay with jitter)
//! ```
//!
//! # Design Decisions
//! - Denials and rate limits are verdicts, not failures; they never retry
//! - Retries never outlive the call deadline
//! - One breaker per target (the oracle and each named backend)

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{BreakerPermit, BreakerRegistry, CircuitBreaker, CircuitOpen, CircuitState};
pub use retries::RetryPolicy;
pub use timeouts::CallTimeouts;
