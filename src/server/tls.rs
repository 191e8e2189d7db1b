//! TLS bootstrap: load a production certificate/key pair, or generate an
//! ephemeral self-signed one for local development (spec §4.H).

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use quinn::crypto::rustls::QuicServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

pub enum TlsMode {
    Production,
    Dev,
}

/// Builds the QUIC-facing server config for either mode described in §4.H.
/// Requires TLS 1.3 and advertises ALPN `"mark"` in both modes.
pub fn build_server_config(
    tls_cert: Option<&Path>,
    tls_key: Option<&Path>,
) -> anyhow::Result<(quinn::ServerConfig, TlsMode)> {
    let (certs, key, mode) = match (tls_cert, tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            (certs, key, TlsMode::Production)
        }
        (None, None) => {
            let (certs, key) = generate_dev_cert()?;
            (certs, key, TlsMode::Dev)
        }
        _ => anyhow::bail!("tls-cert and tls-key must both be set, or both left unset"),
    };

    let mut rustls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building rustls server config")?;
    rustls_config.alpn_protocols = vec![b"mark".to_vec()];

    let quic_crypto = QuicServerConfig::try_from(rustls_config)
        .context("rustls config is not valid for QUIC (requires TLS 1.3)")?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));

    Ok((server_config, mode))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading cert file {path:?}"))?;
    let certs = rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing cert file {path:?}"))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {path:?}");
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading key file {path:?}"))?;
    rustls_pemfile::private_key(&mut bytes.as_slice())
        .with_context(|| format!("parsing key file {path:?}"))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {path:?}"))
}

fn generate_dev_cert() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let names = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)
        .context("generating self-signed dev certificate")?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("dev key is not a valid PKCS#8 key: {e}"))?;

    Ok((vec![cert_der], key_der))
}
