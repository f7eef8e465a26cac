//! Call lifecycle subsystem.
//!
//! # Data Flow
//! ```text
//! front end (validated head + first message)
//!     → context.rs (CallContext: id, deadline, state, counters)
//!     → body.rs (peeked prefix replayed ahead of the live caller stream)
//!     → coordinator.rs (decision → forwarding, or rejection)
//!     → relay.rs (backend response streamed back, call finished at end)
//! ```
//!
//! # Design Decisions
//! - One owner per call at a time; ownership moves, it is never shared
//! - Approved calls are not re-inspected; later frames pass through untouched
//! - Terminal states are recorded exactly once (finish or drop)

pub mod body;
pub mod context;
pub mod coordinator;
pub mod relay;
pub mod state;

pub use body::{CallBody, PeekError};
pub use context::{ActiveCalls, CallContext, CallCounters, CallId};
pub use coordinator::Coordinator;
pub use relay::RelayBody;
pub use state::CallState;
