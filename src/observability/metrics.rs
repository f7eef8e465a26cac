//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_calls_total` (counter): finished calls by terminal state and status code
//! - `gateway_call_duration_seconds` (histogram): call latency
//! - `gateway_verdicts_total` (counter): oracle verdicts by kind
//! - `gateway_backend_attempts_total` (counter): forwarding attempts by backend and result
//! - `gateway_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `gateway_active_calls` (gauge): calls not yet terminal
//! - `gateway_active_connections` (gauge): live caller sessions
//!
//! Recording is a no-op until [`init_metrics`] installs the exporter.

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::grpc::Code;
use crate::resilience::CircuitState;

/// Start the Prometheus scrape endpoint. Must run inside the Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_call(state: &'static str, code: Code, elapsed: Duration) {
    ::metrics::counter!("gateway_calls_total", "state" => state, "code" => code.as_str()).increment(1);
    ::metrics::histogram!("gateway_call_duration_seconds", "state" => state).record(elapsed.as_secs_f64());
}

pub fn record_verdict(verdict: &'static str) {
    ::metrics::counter!("gateway_verdicts_total", "verdict" => verdict).increment(1);
}

pub fn record_backend_attempt(backend: &str, result: &'static str) {
    ::metrics::counter!(
        "gateway_backend_attempts_total",
        "backend" => backend.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_circuit_state(target: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    ::metrics::gauge!("gateway_circuit_state", "target" => target.to_string()).set(value);
}

pub fn set_active_calls(count: usize) {
    ::metrics::gauge!("gateway_active_calls").set(count as f64);
}

pub fn set_active_connections(count: u64) {
    ::metrics::gauge!("gateway_active_connections").set(count as f64);
}
