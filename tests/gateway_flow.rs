//! End-to-end call flows through a running gateway.

mod common;

use std::time::Duration;

use bytes::Bytes;
use hyper::{Request, StatusCode};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{
    channel_body, closed_port, eventually, full_body, gateway_config, grpc_call, send, start_echo_backend,
    start_gateway, start_status_backend,
};
use rpc_gateway::call::coordinator::ORACLE_TARGET;
use rpc_gateway::grpc::framing::encode_message;
use rpc_gateway::grpc::Code;
use rpc_gateway::resilience::CircuitState;

const METHOD: &str = "/echo.Echo/Say";

async fn oracle(template: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/decide"))
        .respond_with(template)
        .mount(&server)
        .await;
    server
}

fn decide_url(server: &MockServer) -> String {
    format!("{}/decide", server.uri())
}

async fn oracle_hits(server: &MockServer) -> usize {
    server.received_requests().await.map(|r| r.len()).unwrap_or(0)
}

#[tokio::test]
async fn test_approved_call_is_relayed() {
    let oracle = oracle(ResponseTemplate::new(200)).await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend.addr])).await;

    let message = encode_message(b"ping");
    let reply = grpc_call(gateway.addr, METHOD, &[("x-tenant", "acme")], full_body(message.clone())).await;

    assert_eq!(reply.http_status, StatusCode::OK);
    assert_eq!(reply.code(), Some(Code::Ok));
    assert_eq!(reply.body, Bytes::from(message));
    assert_eq!(backend.calls(), 1);
    assert_eq!(oracle_hits(&oracle).await, 1);

    let forwarded = backend.last_headers().unwrap();
    assert_eq!(forwarded.get("x-tenant").unwrap(), "acme");
    assert!(forwarded.get("grpc-timeout").is_some());

    assert!(eventually(Duration::from_secs(1), || gateway.coordinator.active_calls().count() == 0).await);
}

#[tokio::test]
async fn test_oracle_sees_method_and_declared_size() {
    let oracle = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/decide"))
        .and(body_partial_json(serde_json::json!({
            "method": METHOD,
            "declared_size": 4,
            "metadata": { "user-agent": "flow-test" }
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&oracle)
        .await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend.addr])).await;

    let reply = grpc_call(
        gateway.addr,
        METHOD,
        &[("user-agent", "flow-test")],
        full_body(encode_message(b"ping")),
    )
    .await;
    assert_eq!(reply.code(), Some(Code::Ok));
}

#[tokio::test]
async fn test_denied_call_never_reaches_backend() {
    let oracle = oracle(ResponseTemplate::new(403).set_body_json(serde_json::json!({ "reason": "blocked" }))).await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend.addr])).await;

    let reply = grpc_call(gateway.addr, METHOD, &[], full_body(encode_message(b"ping"))).await;

    assert_eq!(reply.http_status, StatusCode::OK);
    assert_eq!(reply.code(), Some(Code::PermissionDenied));
    assert_eq!(reply.message(), "blocked");
    assert!(reply.body.is_empty());
    assert_eq!(backend.connections(), 0);
    assert_eq!(gateway.coordinator.backends().get("backend-0").unwrap().connect_attempts(), 0);
}

#[tokio::test]
async fn test_rate_limited_call() {
    let oracle = oracle(ResponseTemplate::new(429).set_body_string("quota")).await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend.addr])).await;

    let reply = grpc_call(gateway.addr, METHOD, &[], full_body(encode_message(b"ping"))).await;

    assert_eq!(reply.code(), Some(Code::ResourceExhausted));
    assert_eq!(reply.message(), "rate limited: quota");
    assert_eq!(backend.connections(), 0);
    // Verdicts are final: no second oracle exchange.
    assert_eq!(oracle_hits(&oracle).await, 1);
}

#[tokio::test]
async fn test_oracle_errors_are_retried_then_unavailable() {
    let oracle = oracle(ResponseTemplate::new(500)).await;
    let backend = start_echo_backend().await;
    let mut config = gateway_config(&decide_url(&oracle), &[backend.addr]);
    config.retries.max_attempts = 2;
    let gateway = start_gateway(config).await;

    let reply = grpc_call(gateway.addr, METHOD, &[], full_body(encode_message(b"ping"))).await;

    assert_eq!(reply.code(), Some(Code::Unavailable));
    assert_eq!(reply.message(), "decision service unavailable");
    assert_eq!(oracle_hits(&oracle).await, 2);
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn test_unreachable_backend_is_retried() {
    let oracle = oracle(ResponseTemplate::new(200)).await;
    let dead = closed_port().await;
    let mut config = gateway_config(&decide_url(&oracle), &[dead]);
    config.retries.max_attempts = 2;
    let gateway = start_gateway(config).await;

    let reply = grpc_call(gateway.addr, METHOD, &[], full_body(encode_message(b"ping"))).await;

    assert_eq!(reply.code(), Some(Code::Unavailable));
    assert_eq!(reply.message(), "backend unavailable");
    let pool = gateway.coordinator.backends().get("backend-0").unwrap();
    assert_eq!(pool.connect_attempts(), 2);
    assert_eq!(oracle_hits(&oracle).await, 1);
}

#[tokio::test]
async fn test_open_breaker_stops_dialing() {
    let oracle = oracle(ResponseTemplate::new(200)).await;
    let dead = closed_port().await;
    let mut config = gateway_config(&decide_url(&oracle), &[dead]);
    config.retries.max_attempts = 1;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.cooldown_ms = 60_000;
    let gateway = start_gateway(config).await;

    for _ in 0..2 {
        let reply = grpc_call(gateway.addr, METHOD, &[], full_body(encode_message(b"ping"))).await;
        assert_eq!(reply.code(), Some(Code::Unavailable));
    }
    let pool = gateway.coordinator.backends().get("backend-0").unwrap();
    assert_eq!(pool.connect_attempts(), 2);

    let reply = grpc_call(gateway.addr, METHOD, &[], full_body(encode_message(b"ping"))).await;
    assert_eq!(reply.code(), Some(Code::Unavailable));
    assert_eq!(reply.message(), "backend unavailable: circuit open");
    assert_eq!(pool.connect_attempts(), 2);
}

#[tokio::test]
async fn test_backend_status_passes_through() {
    let oracle = oracle(ResponseTemplate::new(200)).await;
    let backend = start_status_backend(5).await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend])).await;

    let reply = grpc_call(gateway.addr, METHOD, &[], full_body(encode_message(b"ping"))).await;

    assert_eq!(reply.code(), Some(Code::NotFound));
    assert!(eventually(Duration::from_secs(1), || gateway.coordinator.active_calls().count() == 0).await);
}

#[tokio::test]
async fn test_streamed_messages_arrive_in_order() {
    let oracle = oracle(ResponseTemplate::new(200)).await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend.addr])).await;

    let (tx, body) = channel_body();
    let call = tokio::spawn(grpc_call(gateway.addr, METHOD, &[], body));

    let mut expected = Vec::new();
    for payload in [&b"one"[..], b"two", b"three"] {
        let message = encode_message(payload);
        expected.extend_from_slice(&message);
        tx.send(Bytes::from(message)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    drop(tx);

    let reply = call.await.unwrap();
    assert_eq!(reply.code(), Some(Code::Ok));
    assert_eq!(reply.body, Bytes::from(expected));
    assert_eq!(oracle_hits(&oracle).await, 1);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_oversized_first_message_is_rejected_before_decision() {
    let oracle = oracle(ResponseTemplate::new(200)).await;
    let backend = start_echo_backend().await;
    let mut config = gateway_config(&decide_url(&oracle), &[backend.addr]);
    config.limits.max_message_bytes = 16;
    let gateway = start_gateway(config).await;

    let reply = grpc_call(gateway.addr, METHOD, &[], full_body(encode_message(&[7u8; 64]))).await;

    assert_eq!(reply.code(), Some(Code::InvalidArgument));
    assert_eq!(reply.message(), "message of 64 bytes exceeds the 16 byte limit");
    assert_eq!(oracle_hits(&oracle).await, 0);
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn test_bad_compression_flag_is_rejected() {
    let oracle = oracle(ResponseTemplate::new(200)).await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend.addr])).await;

    let reply = grpc_call(gateway.addr, METHOD, &[], full_body(vec![9u8, 0, 0, 0, 1, 0])).await;

    assert_eq!(reply.code(), Some(Code::InvalidArgument));
    assert_eq!(reply.message(), "invalid compression flag 9");
    assert_eq!(oracle_hits(&oracle).await, 0);
}

#[tokio::test]
async fn test_non_grpc_request_gets_415() {
    let oracle = oracle(ResponseTemplate::new(200)).await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend.addr])).await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("http://{}{}", gateway.addr, METHOD))
        .header("content-type", "application/json")
        .body(full_body("{}"))
        .unwrap();
    let reply = send(gateway.addr, request).await;

    assert_eq!(reply.http_status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(oracle_hits(&oracle).await, 0);
}

#[tokio::test]
async fn test_bad_method_path_is_invalid_argument() {
    let oracle = oracle(ResponseTemplate::new(200)).await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend.addr])).await;

    let reply = grpc_call(gateway.addr, "/not-a-method", &[], full_body(encode_message(b"ping"))).await;

    assert_eq!(reply.code(), Some(Code::InvalidArgument));
    assert_eq!(oracle_hits(&oracle).await, 0);
}

#[tokio::test]
async fn test_slow_oracle_hits_caller_deadline() {
    let oracle = oracle(ResponseTemplate::new(200).set_delay(Duration::from_secs(3))).await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend.addr])).await;

    let started = std::time::Instant::now();
    let reply = grpc_call(
        gateway.addr,
        METHOD,
        &[("grpc-timeout", "200m")],
        full_body(encode_message(b"ping")),
    )
    .await;

    assert_eq!(reply.code(), Some(Code::DeadlineExceeded));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn test_caller_cancellation_releases_call() {
    let oracle = oracle(ResponseTemplate::new(200)).await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend.addr])).await;

    let (tx, body) = channel_body();
    let call = tokio::spawn(grpc_call(gateway.addr, METHOD, &[], body));
    tx.send(Bytes::from(encode_message(b"first"))).await.unwrap();

    assert!(eventually(Duration::from_secs(2), || backend.calls() == 1).await);
    assert_eq!(gateway.coordinator.active_calls().count(), 1);

    call.abort();
    drop(tx);

    assert!(eventually(Duration::from_secs(2), || gateway.coordinator.active_calls().count() == 0).await);
}

#[tokio::test]
async fn test_caller_deadline_does_not_trip_oracle_breaker() {
    let oracle = oracle(ResponseTemplate::new(200).set_delay(Duration::from_millis(400))).await;
    let backend = start_echo_backend().await;
    let mut config = gateway_config(&decide_url(&oracle), &[backend.addr]);
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.cooldown_ms = 60_000;
    let gateway = start_gateway(config).await;

    for _ in 0..3 {
        let reply = grpc_call(
            gateway.addr,
            METHOD,
            &[("grpc-timeout", "100m")],
            full_body(encode_message(b"hurry")),
        )
        .await;
        assert_eq!(reply.code(), Some(Code::DeadlineExceeded));
    }

    let breaker = gateway.coordinator.breakers().get(ORACLE_TARGET);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 0);

    let reply = grpc_call(gateway.addr, METHOD, &[], full_body(encode_message(b"patient"))).await;
    assert_eq!(reply.code(), Some(Code::Ok));
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_caller_gone_while_awaiting_decision() {
    let oracle = oracle(ResponseTemplate::new(200).set_delay(Duration::from_secs(2))).await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(gateway_config(&decide_url(&oracle), &[backend.addr])).await;

    let call = tokio::spawn(grpc_call(gateway.addr, METHOD, &[], full_body(encode_message(b"waiting"))));
    let mut asked = false;
    for _ in 0..200 {
        if oracle_hits(&oracle).await == 1 {
            asked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(asked);
    assert_eq!(gateway.coordinator.active_calls().count(), 1);

    call.abort();

    assert!(eventually(Duration::from_secs(1), || gateway.coordinator.active_calls().count() == 0).await);
    assert_eq!(backend.connections(), 0);
    assert_eq!(backend.calls(), 0);
    let breaker = gateway.coordinator.breakers().get(ORACLE_TARGET);
    assert_eq!(breaker.consecutive_failures(), 0);
    assert_eq!(breaker.state(), CircuitState::Closed);
}
