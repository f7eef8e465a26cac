//! Security context sent to the oracle.
//!
//! Built once per call from the request head and the first frame's length
//! prefix. Payload bytes are never included.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, HeaderName};
use serde::Serialize;

use crate::config::OracleConfig;

/// Immutable per-call summary, serialized as the oracle request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityContext {
    pub call_id: String,
    pub method: String,
    pub timestamp_ms: u64,
    pub caller_ip: IpAddr,
    /// Length prefix of the first message; absent for calls with no messages.
    pub declared_size: Option<u32>,
    pub metadata: BTreeMap<String, String>,
}

/// Which caller metadata reaches the oracle, and how much of it.
#[derive(Debug, Clone)]
pub struct MetadataPolicy {
    allow: Vec<HeaderName>,
    max_value_len: usize,
}

impl MetadataPolicy {
    pub fn new(allow: Vec<HeaderName>, max_value_len: usize) -> Self {
        Self { allow, max_value_len }
    }

    pub fn from_config(config: &OracleConfig) -> Self {
        let allow = config
            .forwarded_metadata
            .iter()
            .filter_map(|key| HeaderName::from_bytes(key.as_bytes()).ok())
            .collect();
        Self::new(allow, config.max_metadata_value_len)
    }

    /// Copy allow-listed, textual metadata. Binary (`-bin`) keys and
    /// non-ASCII values are skipped; long values are truncated.
    pub fn select(&self, headers: &HeaderMap) -> BTreeMap<String, String> {
        let mut selected = BTreeMap::new();
        for name in &self.allow {
            if name.as_str().ends_with("-bin") {
                continue;
            }
            let values: Vec<&str> = headers
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect();
            if values.is_empty() {
                continue;
            }
            let joined = values.join(",");
            selected.insert(name.as_str().to_string(), truncate(&joined, self.max_value_len));
        }
        selected
    }
}

fn truncate(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

impl SecurityContext {
    pub fn capture(
        call_id: String,
        method: &str,
        caller_ip: IpAddr,
        declared_size: Option<u32>,
        headers: &HeaderMap,
        policy: &MetadataPolicy,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        Self {
            call_id,
            method: method.to_string(),
            timestamp_ms,
            caller_ip,
            declared_size,
            metadata: policy.select(headers),
        }
    }
}
