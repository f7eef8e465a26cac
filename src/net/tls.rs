//! TLS configuration and certificate loading.
//!
//! Both directions negotiate HTTP/2 through ALPN. Certificates and keys are
//! read from PEM files once at startup; a bad file is a startup error.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;

use crate::config::{BackendTlsConfig, ListenerTlsConfig};

/// ALPN id for HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";

/// Error type for TLS setup.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error("client certificate verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),

    #[error("invalid server name `{0}`")]
    InvalidServerName(String),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn read_pem(path: &str) -> Result<Vec<u8>, TlsError> {
    fs::read(Path::new(path)).map_err(|source| TlsError::Io {
        path: path.to_string(),
        source,
    })
}

/// Load every certificate in a PEM file.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_pem(path)?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }
    Ok(certs)
}

/// Load the first private key in a PEM file.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_pem(path)?;
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_string()))
}

fn load_roots(path: &str) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server config for the caller-facing listener.
///
/// With `client_ca_path` set, callers must present a certificate chaining to
/// one of those roots.
pub fn server_config(config: &ListenerTlsConfig) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let builder = ServerConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
    let mut tls_config = match &config.client_ca_path {
        Some(ca_path) => {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(load_roots(ca_path)?), provider()).build()?;
            builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };
    tls_config.alpn_protocols = vec![ALPN_H2.to_vec()];

    tracing::info!(
        cert_path = %config.cert_path,
        client_auth = config.client_ca_path.is_some(),
        "Listener TLS configured"
    );
    Ok(Arc::new(tls_config))
}

/// Client config for backend connections.
pub fn client_config(config: &BackendTlsConfig) -> Result<Arc<ClientConfig>, TlsError> {
    let roots = load_roots(&config.ca_path)?;
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots);

    let mut tls_config = match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            builder.with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)?
        }
        _ => builder.with_no_client_auth(),
    };
    tls_config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(Arc::new(tls_config))
}

/// Name to verify in a backend certificate.
pub fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string()).map_err(|_| TlsError::InvalidServerName(name.to_string()))
}
