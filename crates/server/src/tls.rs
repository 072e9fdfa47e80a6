use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Build a `rustls::ServerConfig` from a configured cert/key pair.
///
/// TLS is optional: the caller only invokes this when both `cert_path` and `key_path`
/// are set (config validation already rejects the case where only one is). There is
/// no self-signed fallback — a relay with no TLS material configured simply serves
/// plain HTTP, which is the common case behind a terminating load balancer.
pub fn build_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig> {
    let (certs, key) = load_certs_from_files(cert_path, key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build TLS server config")?;
    Ok(config)
}

/// Load certificate chain and private key from PEM files on disk.
fn load_certs_from_files(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("failed to read TLS cert: {cert_path}"))?;
    let key_pem =
        std::fs::read(key_path).with_context(|| format!("failed to read TLS key: {key_path}"))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse TLS certificate PEM")?;

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("failed to parse TLS private key PEM")?
        .context("no private key found in PEM file")?;

    tracing::info!("loaded TLS cert from {cert_path}");
    Ok((certs, key))
}

/// Helper to create a `tokio_rustls::TlsAcceptor` from a `rustls::ServerConfig`.
pub fn make_acceptor(config: ServerConfig) -> tokio_rustls::TlsAcceptor {
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}
