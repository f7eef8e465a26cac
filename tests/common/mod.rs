//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use rpc_gateway::call::Coordinator;
use rpc_gateway::config::{BackendConfig, GatewayConfig};
use rpc_gateway::grpc::Status;
use rpc_gateway::net::Listener;
use rpc_gateway::{GatewayServer, Shutdown};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type TestBody = UnsyncBoxBody<Bytes, BoxError>;

/// A running gateway bound to an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub coordinator: Arc<Coordinator>,
    pub shutdown: Shutdown,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Start a gateway with `config`. The configured bind address is ignored.
pub async fn start_gateway(config: GatewayConfig) -> TestGateway {
    let server = GatewayServer::new(&config).unwrap();
    let coordinator = Arc::clone(server.coordinator());
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener = Listener::from_tcp(tcp, config.listener.max_connections);
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, receiver).await;
    });

    TestGateway {
        addr,
        coordinator,
        shutdown,
    }
}

/// Config pointing at `oracle` (a full URL) and backends at `backends`,
/// with fast retries and metrics off.
pub fn gateway_config(oracle: &str, backends: &[SocketAddr]) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.listener.drain_timeout_secs = 1;
    config.oracle.endpoint = oracle.to_string();
    config.oracle.timeout_ms = 1_000;
    config.backends = backends
        .iter()
        .enumerate()
        .map(|(i, addr)| BackendConfig {
            name: format!("backend-{i}"),
            address: addr.to_string(),
            max_connections: None,
        })
        .collect();
    config.timeouts.connect_ms = 500;
    config.timeouts.default_deadline_ms = 5_000;
    config.retries.base_delay_ms = 5;
    config.retries.max_delay_ms = 20;
    config.observability.metrics_enabled = false;
    config
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    tcp.local_addr().unwrap()
}

/// HTTP/2 backend that echoes every request message back and ends with
/// `grpc-status: 0`.
pub struct EchoBackend {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    last_headers: Arc<Mutex<Option<HeaderMap>>>,
}

impl EchoBackend {
    /// Physical connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Calls (streams) served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Request headers of the most recent call.
    pub fn last_headers(&self) -> Option<HeaderMap> {
        self.last_headers.lock().unwrap().clone()
    }
}

pub async fn start_echo_backend() -> EchoBackend {
    start_echo_backend_with(None).await
}

/// Echo backend, behind TLS when `tls` is given.
pub async fn start_echo_backend_with(tls: Option<TlsAcceptor>) -> EchoBackend {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let last_headers = Arc::new(Mutex::new(None));

    let backend = EchoBackend {
        addr,
        connections: Arc::clone(&connections),
        calls: Arc::clone(&calls),
        last_headers: Arc::clone(&last_headers),
    };

    tokio::spawn(async move {
        while let Ok((socket, _)) = tcp.accept().await {
            let calls = Arc::clone(&calls);
            let last_headers = Arc::clone(&last_headers);
            match &tls {
                Some(acceptor) => {
                    let acceptor = acceptor.clone();
                    let connections = Arc::clone(&connections);
                    tokio::spawn(async move {
                        if let Ok(stream) = acceptor.accept(socket).await {
                            connections.fetch_add(1, Ordering::SeqCst);
                            serve_echo(stream, calls, last_headers).await;
                        }
                    });
                }
                None => {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_echo(socket, calls, last_headers));
                }
            }
        }
    });

    backend
}

async fn serve_echo<S>(io: S, calls: Arc<AtomicUsize>, last_headers: Arc<Mutex<Option<HeaderMap>>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |request: Request<Incoming>| {
        calls.fetch_add(1, Ordering::SeqCst);
        *last_headers.lock().unwrap() = Some(request.headers().clone());
        echo(request)
    });
    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await;
}

async fn echo(request: Request<Incoming>) -> Result<Response<UnsyncBoxBody<Bytes, Infallible>>, Infallible> {
    let (tx, rx) = mpsc::channel::<Frame<Bytes>>(16);
    let mut incoming = request.into_body();
    tokio::spawn(async move {
        while let Some(Ok(frame)) = incoming.frame().await {
            if let Ok(data) = frame.into_data() {
                if tx.send(Frame::data(data)).await.is_err() {
                    return;
                }
            }
        }
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        let _ = tx.send(Frame::trailers(trailers)).await;
    });

    let body = StreamBody::new(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    }));
    let response = Response::builder()
        .header("content-type", "application/grpc")
        .body(body.boxed_unsync())
        .unwrap();
    Ok(response)
}

/// HTTP/2 backend that answers every call trailers-only with `code`.
pub async fn start_status_backend(code: u16) -> SocketAddr {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = tcp.accept().await {
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |_request: Request<Incoming>| async move {
                    let response = Response::builder()
                        .header("content-type", "application/grpc")
                        .header("grpc-status", code.to_string())
                        .body(Full::new(Bytes::new()))
                        .unwrap();
                    Ok::<_, Infallible>(response)
                });
                let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(socket), service)
                    .await;
            });
        }
    });
    addr
}

/// What a gRPC caller observed.
#[derive(Debug)]
pub struct GrpcReply {
    pub http_status: StatusCode,
    pub headers: HeaderMap,
    /// From trailers, or from the response head for trailers-only replies.
    pub status: Option<Status>,
    pub body: Bytes,
}

impl GrpcReply {
    pub fn code(&self) -> Option<rpc_gateway::grpc::Code> {
        self.status.as_ref().map(Status::code)
    }

    pub fn message(&self) -> &str {
        self.status.as_ref().map(Status::message).unwrap_or_default()
    }
}

/// Request body from a fixed byte string.
pub fn full_body(bytes: impl Into<Bytes>) -> TestBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

/// Request body fed chunk by chunk; dropping the sender ends the stream.
pub fn channel_body() -> (mpsc::Sender<Bytes>, TestBody) {
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    let body = StreamBody::new(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(Frame::data(chunk)), rx))
    }));
    (tx, body.map_err(|never| match never {}).boxed_unsync())
}

/// A gRPC request for `path` on `addr`.
pub fn grpc_request(addr: SocketAddr, path: &str, metadata: &[(&str, &str)], body: TestBody) -> Request<TestBody> {
    let mut request = Request::builder()
        .method("POST")
        .uri(format!("http://{addr}{path}"))
        .header("content-type", "application/grpc")
        .header("te", "trailers");
    for (name, value) in metadata {
        request = request.header(*name, *value);
    }
    request.body(body).unwrap()
}

/// Make one gRPC call to the gateway over a fresh h2c connection.
pub async fn grpc_call(addr: SocketAddr, path: &str, metadata: &[(&str, &str)], body: TestBody) -> GrpcReply {
    send(addr, grpc_request(addr, path, metadata, body)).await
}

/// Send an arbitrary request over a fresh h2c connection.
pub async fn send(addr: SocketAddr, request: Request<TestBody>) -> GrpcReply {
    let stream = TcpStream::connect(addr).await.unwrap();
    send_over(stream, request).await.unwrap()
}

/// Send `request` as the only call on a new HTTP/2 connection over `io`.
pub async fn send_over<S>(io: S, request: Request<TestBody>) -> Result<GrpcReply, BoxError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
    tokio::spawn(connection);

    let response = sender.send_request(request).await?;
    let (parts, body) = response.into_parts();
    let collected = body.collect().await?;
    let status = collected
        .trailers()
        .and_then(Status::from_header_map)
        .or_else(|| Status::from_header_map(&parts.headers));

    Ok(GrpcReply {
        http_status: parts.status,
        headers: parts.headers,
        status,
        body: collected.to_bytes(),
    })
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
