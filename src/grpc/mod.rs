//! gRPC wire details the gateway needs without decoding payloads.
//!
//! # Data Flow
//! ```text
//! caller stream bytes → framing.rs (boundary validation only)
//! grpc-timeout header → timeout.rs (deadline in, remaining budget out)
//! gateway failure     → mapper.rs → status.rs (grpc-status / grpc-message)
//! ```

pub mod framing;
pub mod mapper;
pub mod status;
pub mod timeout;

pub use status::{Code, Status};

/// Content type prefix shared by every gRPC call.
pub const CONTENT_TYPE: &str = "application/grpc";
