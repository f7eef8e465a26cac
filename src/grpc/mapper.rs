//! Gateway outcome to caller status mapping.
//!
//! This is the only place gateway-produced failures become caller-visible
//! statuses. Messages for internal faults are fixed text; diagnostic detail
//! goes to the logs, never to the caller.

use crate::error::GatewayError;
use crate::grpc::status::{Code, Status};

/// Caller-visible status for a gateway-produced failure.
pub fn error_status(err: &GatewayError) -> Status {
    match err {
        GatewayError::Malformed(reason) => Status::invalid_argument(reason.clone()),
        GatewayError::Denied(reason) => Status::new(
            Code::PermissionDenied,
            reason.clone().unwrap_or_else(|| "permission denied".to_string()),
        ),
        GatewayError::RateLimited(reason) => Status::new(
            Code::ResourceExhausted,
            match reason {
                Some(reason) => format!("rate limited: {reason}"),
                None => "rate limited".to_string(),
            },
        ),
        GatewayError::OracleUnavailable(_) => Status::unavailable("decision service unavailable"),
        GatewayError::CircuitOpen { .. } => Status::unavailable("backend unavailable: circuit open"),
        GatewayError::BackendUnreachable { .. }
        | GatewayError::ConnectTimeout { .. }
        | GatewayError::BackendStream { .. } => Status::unavailable("backend unavailable"),
        GatewayError::PoolExhausted { .. } => Status::unavailable("backend unavailable: no capacity"),
        GatewayError::DeadlineExceeded => Status::deadline_exceeded(),
        GatewayError::Cancelled(_) => Status::new(Code::Cancelled, "call cancelled"),
        GatewayError::Internal(_) => Status::internal(),
    }
}
