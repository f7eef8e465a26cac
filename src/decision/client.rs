//! HTTP/1.1 client for the decision oracle.
//!
//! One POST per attempt; the client keeps no per-call state. Retries and the
//! oracle's circuit breaker are applied by the caller.

use std::time::Duration;

use serde::Deserialize;

use crate::config::OracleConfig;
use crate::decision::context::{MetadataPolicy, SecurityContext};
use crate::decision::verdict::{OracleOutcome, Verdict};

/// Upper bound on how much of a reply body is read for a reason.
const MAX_REASON_BYTES: usize = 512;
/// Reasons longer than this are cut before reaching the caller.
const MAX_REASON_CHARS: usize = 200;

const USER_AGENT: &str = concat!("rpc-gateway/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct ReasonBody {
    reason: Option<String>,
}

/// Client for the decision oracle.
#[derive(Debug, Clone)]
pub struct DecisionClient {
    http: reqwest::Client,
    endpoint: String,
    policy: MetadataPolicy,
}

impl DecisionClient {
    pub fn new(config: &OracleConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .http1_only()
            .timeout(config.timeout())
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            policy: MetadataPolicy::from_config(config),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn metadata_policy(&self) -> &MetadataPolicy {
        &self.policy
    }

    /// One decision exchange, bounded by `timeout`.
    ///
    /// Transport failures, timeouts and unexpected statuses all come back as
    /// [`Verdict::OracleError`]; this never fails otherwise.
    pub async fn decide(&self, context: &SecurityContext, timeout: Duration) -> Verdict {
        let response = match self
            .http
            .post(&self.endpoint)
            .timeout(timeout)
            .json(context)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let reason = if e.is_timeout() {
                    "oracle timed out".to_string()
                } else {
                    format!("oracle request failed: {e}")
                };
                tracing::debug!(call_id = %context.call_id, error = %e, "Decision exchange failed");
                return Verdict::OracleError(reason);
            }
        };

        let outcome = OracleOutcome::classify(response.status());
        let reason = if outcome.wants_reason() {
            read_reason(response).await
        } else {
            None
        };
        outcome.into_verdict(reason)
    }
}

async fn read_reason(mut response: reqwest::Response) -> Option<String> {
    let mut body = Vec::new();
    while body.len() < MAX_REASON_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) => break,
            // The status already decided the verdict; a broken body only loses the reason.
            Err(_) => break,
        }
    }
    body.truncate(MAX_REASON_BYTES);
    parse_reason(&body)
}

fn parse_reason(body: &[u8]) -> Option<String> {
    let text = match serde_json::from_slice::<ReasonBody>(body) {
        Ok(parsed) => parsed.reason?,
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_REASON_CHARS).collect())
}
