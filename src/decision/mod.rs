//! Decision oracle subsystem.
//!
//! # Data Flow
//! ```text
//! call head + first frame length
//!     → context.rs (SecurityContext, allow-listed metadata only)
//!     → client.rs (HTTP/1.1 POST, JSON body)
//!     → verdict.rs (status code → OracleOutcome → Verdict)
//! ```

pub mod client;
pub mod context;
pub mod verdict;

pub use client::DecisionClient;
pub use context::{MetadataPolicy, SecurityContext};
pub use verdict::{OracleOutcome, Verdict};
