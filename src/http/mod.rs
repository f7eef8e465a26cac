//! HTTP/2 front end.
//!
//! # Data Flow
//! ```text
//! TCP/TLS session
//!     → server.rs (hyper HTTP/2, every path routed to one handler)
//!     → request.rs (content type, method path, grpc-timeout)
//!     → call::body (first message peeked and validated)
//!     → call::coordinator (decision, backend, relay)
//!     → response.rs (trailers-only statuses for gateway failures)
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{parse_head, CallHead, HeadError};
pub use server::GatewayServer;
