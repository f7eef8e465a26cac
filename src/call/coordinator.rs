//! Call lifecycle coordinator.
//!
//! # Flow
//! ```text
//! EXTRACTING        build SecurityContext from head + first length prefix
//! AWAITING_DECISION oracle exchange (breaker + retries)
//! FORWARDING        backend attempt(s) (round-robin, breaker + retries)
//! → RelayBody owns the call until the backend stream ends
//! ```
//!
//! Every step runs under the call's single deadline. Dropping the future
//! (the caller reset the stream) drops whatever step is outstanding, and the
//! `CallContext` records the cancellation.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE};
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderName, Request, Response, Version};

use crate::backend::{BackendManager, SendFailure, Sent};
use crate::call::body::CallBody;
use crate::call::context::{ActiveCalls, CallContext};
use crate::call::relay::RelayBody;
use crate::call::state::CallState;
use crate::config::{GatewayConfig, RetryOn};
use crate::decision::{DecisionClient, SecurityContext, Verdict};
use crate::error::{GatewayError, StartupError};
use crate::grpc::mapper::error_status;
use crate::grpc::status::GRPC_STATUS;
use crate::grpc::timeout::{encode_timeout, GRPC_TIMEOUT};
use crate::grpc::Status;
use crate::http::response::status_response;
use crate::observability::metrics;
use crate::resilience::{BreakerRegistry, CallTimeouts, RetryPolicy};

/// Breaker target name for the decision oracle.
pub const ORACLE_TARGET: &str = "oracle";

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Drives each call from decision to forwarding.
#[derive(Debug)]
pub struct Coordinator {
    decision: DecisionClient,
    backends: Arc<BackendManager>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    timeouts: CallTimeouts,
    active: ActiveCalls,
}

impl Coordinator {
    pub fn new(
        decision: DecisionClient,
        backends: Arc<BackendManager>,
        breakers: Arc<BreakerRegistry>,
        retry: RetryPolicy,
        timeouts: CallTimeouts,
    ) -> Self {
        Self {
            decision,
            backends,
            breakers,
            retry,
            timeouts,
            active: ActiveCalls::new(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, StartupError> {
        Ok(Self::new(
            DecisionClient::new(&config.oracle)?,
            Arc::new(BackendManager::from_config(config)?),
            Arc::new(BreakerRegistry::new(config.circuit_breaker.clone())),
            RetryPolicy::from_config(&config.retries),
            CallTimeouts::from_config(config),
        ))
    }

    pub fn backends(&self) -> &Arc<BackendManager> {
        &self.backends
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn active_calls(&self) -> &ActiveCalls {
        &self.active
    }

    pub fn timeouts(&self) -> &CallTimeouts {
        &self.timeouts
    }

    /// Run a call whose first message has been validated. Always returns a
    /// response; gateway failures become trailers-only statuses.
    pub async fn handle(&self, mut call: CallContext, parts: Parts, body: CallBody) -> Response<Body> {
        let deadline = call.deadline();
        let outcome = tokio::time::timeout_at(deadline, self.drive(&mut call, parts, body)).await;
        match outcome {
            Ok(Ok(sent)) => relay(call, sent),
            Ok(Err(err)) => reject(call, err),
            Err(_) => reject(call, GatewayError::DeadlineExceeded),
        }
    }

    async fn drive(&self, call: &mut CallContext, parts: Parts, body: CallBody) -> Result<Sent, GatewayError> {
        call.advance(CallState::Extracting)?;
        let security = SecurityContext::capture(
            call.id().to_string(),
            call.method(),
            call.peer().ip(),
            body.declared_size(),
            call.metadata(),
            self.decision.metadata_policy(),
        );

        call.advance(CallState::AwaitingDecision)?;
        let verdict = self.decide(call, &security).await;
        metrics::record_verdict(verdict.label());
        tracing::debug!(call_id = %call.id(), verdict = verdict.label(), "Verdict");
        match verdict {
            Verdict::Approved => {}
            Verdict::Denied(reason) => return Err(GatewayError::Denied(reason)),
            Verdict::RateLimited(reason) => return Err(GatewayError::RateLimited(reason)),
            Verdict::OracleError(_) if call.remaining().is_zero() => return Err(GatewayError::DeadlineExceeded),
            Verdict::OracleError(reason) => return Err(GatewayError::OracleUnavailable(reason)),
        }

        call.advance(CallState::Forwarding)?;
        let request = backend_request(call, parts, body);
        self.forward(call, request).await
    }

    /// Oracle exchange with breaker and retries. Only the final verdict is returned.
    async fn decide(&self, call: &CallContext, security: &SecurityContext) -> Verdict {
        let breaker = self.breakers.get(ORACLE_TARGET);
        let mut attempt = 1;
        loop {
            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => return Verdict::OracleError(format!("circuit open for {}", open.target)),
            };

            let remaining = call.remaining();
            let cut_short = remaining < self.timeouts.decision;
            let verdict = self.decision.decide(security, self.timeouts.decision.min(remaining)).await;
            let Verdict::OracleError(reason) = &verdict else {
                permit.success();
                return verdict;
            };
            if cut_short && call.remaining().is_zero() {
                // The caller's deadline ended the exchange, not the oracle.
                drop(permit);
                return verdict;
            }
            permit.failure();

            let Some(delay) = self.retry.next_delay(attempt, RetryOn::OracleError) else {
                return verdict;
            };
            tracing::warn!(
                call_id = %call.id(),
                attempt,
                reason = %reason,
                delay_ms = delay.as_millis() as u64,
                "Decision exchange failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Backend attempts. A failed attempt is retried only while the request
    /// never reached a backend stream.
    async fn forward(&self, call: &mut CallContext, mut request: Request<CallBody>) -> Result<Sent, GatewayError> {
        let mut attempt = 1;
        loop {
            let pool = self
                .backends
                .select(|pool| self.breakers.get(pool.name()).allows_attempt())
                .ok_or_else(|| GatewayError::CircuitOpen {
                    target: "all backends".to_string(),
                })?;
            let permit = self
                .breakers
                .get(pool.name())
                .try_acquire()
                .map_err(|open| GatewayError::CircuitOpen { target: open.target })?;

            let failure = match pool.send(request).await {
                Ok(sent) => {
                    let unavailable = is_unavailable(&sent);
                    if unavailable {
                        permit.failure();
                    } else {
                        permit.success();
                    }
                    metrics::record_backend_attempt(pool.name(), if unavailable { "unavailable" } else { "ok" });
                    call.assign_backend(sent.lease.connection().describe());
                    return Ok(sent);
                }
                Err(failure) => failure,
            };

            let SendFailure { error, request: returned } = failure;
            if error.is_backend_fault() {
                permit.failure();
            }
            metrics::record_backend_attempt(pool.name(), "error");
            tracing::warn!(
                call_id = %call.id(),
                backend = %pool.name(),
                attempt,
                error = %error,
                "Forwarding attempt failed"
            );

            let Some(returned) = returned else {
                return Err(error);
            };
            let Some(delay) = error.retry_kind().and_then(|kind| self.retry.next_delay(attempt, kind)) else {
                return Err(error);
            };
            request = returned;
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Trailers-only UNAVAILABLE from the backend counts against its breaker.
fn is_unavailable(sent: &Sent) -> bool {
    sent.response
        .headers()
        .get(&GRPC_STATUS)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim() == "14")
}

/// Request toward the backend: same path, metadata and body, hop-by-hop
/// headers removed and `grpc-timeout` set to what is left of the deadline.
fn backend_request(call: &CallContext, mut parts: Parts, body: CallBody) -> Request<CallBody> {
    for name in [HOST, CONNECTION, TRANSFER_ENCODING, UPGRADE, KEEP_ALIVE, PROXY_CONNECTION] {
        parts.headers.remove(name);
    }
    parts
        .headers
        .insert(HeaderName::from_static(GRPC_TIMEOUT), encode_timeout(call.remaining()));
    parts.version = Version::HTTP_2;
    parts.extensions = Extensions::new();
    Request::from_parts(parts, body)
}

fn relay(call: CallContext, sent: Sent) -> Response<Body> {
    let Sent { response, lease } = sent;
    let (parts, incoming) = response.into_parts();
    let header_code = Status::from_header_map(&parts.headers).map(|status| status.code());
    Response::from_parts(parts, Body::new(RelayBody::new(incoming, call, lease, header_code)))
}

/// End `call` with the caller-visible status for `err`.
pub(crate) fn reject(call: CallContext, err: GatewayError) -> Response<Body> {
    let status = error_status(&err);
    let state = match err {
        GatewayError::Denied(_) | GatewayError::RateLimited(_) => {
            tracing::info!(call_id = %call.id(), method = %call.method(), reason = %status.message(), "Call rejected");
            CallState::Rejected
        }
        GatewayError::Internal(ref detail) => {
            tracing::error!(call_id = %call.id(), detail = %detail, "Internal error");
            CallState::Failed
        }
        GatewayError::Malformed(_) | GatewayError::Cancelled(_) => {
            tracing::debug!(call_id = %call.id(), error = %err, "Call ended before dispatch");
            CallState::Failed
        }
        ref other => {
            tracing::warn!(call_id = %call.id(), error = %other, "Call failed");
            CallState::Failed
        }
    };
    call.finish(state, status.code());
    status_response(&status)
}
