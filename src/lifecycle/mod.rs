//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     broadcast → accept loop stops → sessions get GOAWAY → drain with timeout
//! ```
//!
//! Startup order lives in `main.rs`: config, logging, metrics, gateway, listener.

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
