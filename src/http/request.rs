//! Call head validation.
//!
//! # Responsibilities
//! - Recognize gRPC requests by content type
//! - Validate method, path shape and `grpc-timeout`
//!
//! Only the head is checked here; body framing is validated by the call body.

use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::http::request::Parts;
use axum::http::Method;
use thiserror::Error;

use crate::grpc;
use crate::grpc::timeout::{parse_timeout, GRPC_TIMEOUT};

/// What the front end needs from a valid call head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHead {
    /// Full method path, `/<service>/<method>`.
    pub method: String,
    /// Caller's `grpc-timeout`, if sent.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeadError {
    /// Not a gRPC request at all; answered with plain HTTP 415.
    #[error("unsupported content type `{0}`")]
    NotGrpc(String),
    /// A gRPC request with a bad head; answered with INVALID_ARGUMENT.
    #[error("{0}")]
    Malformed(String),
}

fn is_grpc_content_type(value: &str) -> bool {
    match value.strip_prefix(grpc::CONTENT_TYPE) {
        Some(rest) => rest.is_empty() || rest.starts_with('+') || rest.starts_with(';'),
        None => false,
    }
}

fn is_method_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    match rest.split_once('/') {
        Some((service, method)) => !service.is_empty() && !method.is_empty() && !method.contains('/'),
        None => false,
    }
}

pub fn parse_head(parts: &Parts) -> Result<CallHead, HeadError> {
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !is_grpc_content_type(content_type) {
        return Err(HeadError::NotGrpc(content_type.to_string()));
    }

    if parts.method != Method::POST {
        return Err(HeadError::Malformed(format!("method must be POST, got {}", parts.method)));
    }

    let path = parts.uri.path();
    if !is_method_path(path) {
        return Err(HeadError::Malformed(format!("invalid method path `{path}`")));
    }

    let timeout = match parts.headers.get(GRPC_TIMEOUT) {
        Some(value) => Some(parse_timeout(value).ok_or_else(|| {
            HeadError::Malformed(format!(
                "invalid grpc-timeout `{}`",
                String::from_utf8_lossy(value.as_bytes())
            ))
        })?),
        None => None,
    };

    Ok(CallHead {
        method: path.to_string(),
        timeout,
    })
}
