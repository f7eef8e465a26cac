//! Security-gated gRPC gateway.
//!
//! Callers speak gRPC over HTTP/2. Before a call reaches a backend, a
//! decision service is asked over HTTP/1.1 whether it may proceed; approved
//! calls are relayed to a pooled backend connection and the backend's
//! stream (trailers included) flows back untouched.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;

// Call path
pub mod backend;
pub mod call;
pub mod decision;
pub mod grpc;

// Cross-cutting concerns
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::GatewayConfig;
pub use error::{GatewayError, StartupError};
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
