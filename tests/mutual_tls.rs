//! Mutual TLS on both sides of the gateway.

mod common;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{
    full_body, gateway_config, grpc_request, send_over, start_echo_backend, start_echo_backend_with, start_gateway,
    BoxError, GrpcReply,
};
use rpc_gateway::config::{BackendTlsConfig, GatewayConfig, ListenerTlsConfig};
use rpc_gateway::grpc::framing::encode_message;
use rpc_gateway::grpc::Code;
use rpc_gateway::net::tls;

const METHOD: &str = "/echo.Echo/Say";

/// A throwaway CA plus one server and one client identity, as PEM files.
struct Pki {
    _dir: tempfile::TempDir,
    ca: String,
    server_cert: String,
    server_key: String,
    client_cert: String,
    client_key: String,
}

fn write(dir: &Path, name: &str, pem: String) -> String {
    let path = dir.join(name);
    std::fs::write(&path, pem).unwrap();
    path.to_string_lossy().into_owned()
}

fn leaf(ca: &Certificate, ca_key: &KeyPair, usage: ExtendedKeyUsagePurpose) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params.extended_key_usages = vec![usage];
    let cert = params.signed_by(&key, ca, ca_key).unwrap();
    (cert.pem(), key.serialize_pem())
}

fn pki() -> Pki {
    let dir = tempfile::tempdir().unwrap();

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
    ca_params.distinguished_name.push(DnType::CommonName, "gateway test ca");
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let (server_cert, server_key) = leaf(&ca, &ca_key, ExtendedKeyUsagePurpose::ServerAuth);
    let (client_cert, client_key) = leaf(&ca, &ca_key, ExtendedKeyUsagePurpose::ClientAuth);

    Pki {
        ca: write(dir.path(), "ca.pem", ca.pem()),
        server_cert: write(dir.path(), "server.pem", server_cert),
        server_key: write(dir.path(), "server-key.pem", server_key),
        client_cert: write(dir.path(), "client.pem", client_cert),
        client_key: write(dir.path(), "client-key.pem", client_key),
        _dir: dir,
    }
}

impl Pki {
    /// Server side that demands a client certificate from this CA.
    fn strict_server(&self) -> ListenerTlsConfig {
        ListenerTlsConfig {
            cert_path: self.server_cert.clone(),
            key_path: self.server_key.clone(),
            client_ca_path: Some(self.ca.clone()),
        }
    }

    fn caller(&self, with_identity: bool) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        for cert in tls::load_certs(&self.ca).unwrap() {
            roots.add(cert).unwrap();
        }
        let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots);
        let mut config = if with_identity {
            builder
                .with_client_auth_cert(
                    tls::load_certs(&self.client_cert).unwrap(),
                    tls::load_private_key(&self.client_key).unwrap(),
                )
                .unwrap()
        } else {
            builder.with_no_client_auth()
        };
        config.alpn_protocols = vec![tls::ALPN_H2.to_vec()];
        TlsConnector::from(Arc::new(config))
    }
}

async fn approving_oracle() -> (MockServer, String) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let url = format!("{}/decide", server.uri());
    (server, url)
}

async fn call_over_tls(addr: SocketAddr, connector: &TlsConnector) -> Result<GrpcReply, BoxError> {
    let tcp = TcpStream::connect(addr).await?;
    let stream = connector.connect(ServerName::try_from("localhost")?, tcp).await?;
    let request = grpc_request(addr, METHOD, &[], full_body(encode_message(b"secure")));
    send_over(stream, request).await
}

fn tls_gateway_config(url: &str, pki: &Pki, backends: &[SocketAddr]) -> GatewayConfig {
    let mut config = gateway_config(url, backends);
    config.listener.tls = Some(pki.strict_server());
    config
}

#[tokio::test]
async fn test_caller_with_certificate_is_served() {
    let pki = pki();
    let (_oracle, url) = approving_oracle().await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(tls_gateway_config(&url, &pki, &[backend.addr])).await;

    let reply = call_over_tls(gateway.addr, &pki.caller(true)).await.unwrap();

    assert_eq!(reply.code(), Some(Code::Ok));
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_caller_without_certificate_is_refused() {
    let pki = pki();
    let (oracle, url) = approving_oracle().await;
    let backend = start_echo_backend().await;
    let gateway = start_gateway(tls_gateway_config(&url, &pki, &[backend.addr])).await;

    let outcome = tokio::time::timeout(Duration::from_secs(3), call_over_tls(gateway.addr, &pki.caller(false))).await;

    assert!(!matches!(outcome, Ok(Ok(_))));
    assert_eq!(backend.calls(), 0);
    assert_eq!(oracle.received_requests().await.map(|r| r.len()).unwrap_or(0), 0);
}

#[tokio::test]
async fn test_backend_requiring_client_certificate() {
    let pki = pki();
    let (_oracle, url) = approving_oracle().await;
    let acceptor = TlsAcceptor::from(tls::server_config(&pki.strict_server()).unwrap());
    let backend = start_echo_backend_with(Some(acceptor)).await;

    let mut config = tls_gateway_config(&url, &pki, &[backend.addr]);
    config.backend_tls = Some(BackendTlsConfig {
        ca_path: pki.ca.clone(),
        cert_path: Some(pki.client_cert.clone()),
        key_path: Some(pki.client_key.clone()),
        server_name: Some("localhost".to_string()),
    });
    let gateway = start_gateway(config).await;

    let reply = call_over_tls(gateway.addr, &pki.caller(true)).await.unwrap();

    assert_eq!(reply.code(), Some(Code::Ok));
    assert_eq!(backend.calls(), 1);
    assert_eq!(backend.connections(), 1);
    let forwarded = backend.last_headers().unwrap();
    assert!(forwarded.get("grpc-timeout").is_some());
}

#[tokio::test]
async fn test_gateway_without_client_identity_cannot_reach_strict_backend() {
    let pki = pki();
    let (_oracle, url) = approving_oracle().await;
    let acceptor = TlsAcceptor::from(tls::server_config(&pki.strict_server()).unwrap());
    let backend = start_echo_backend_with(Some(acceptor)).await;

    let mut config = tls_gateway_config(&url, &pki, &[backend.addr]);
    config.backend_tls = Some(BackendTlsConfig {
        ca_path: pki.ca.clone(),
        cert_path: None,
        key_path: None,
        server_name: Some("localhost".to_string()),
    });
    let gateway = start_gateway(config).await;

    let reply = call_over_tls(gateway.addr, &pki.caller(true)).await.unwrap();

    assert_eq!(reply.code(), Some(Code::Unavailable));
    assert_eq!(backend.calls(), 0);
}
