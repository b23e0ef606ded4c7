use anyhow::Context;
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;

pub fn make_server_config(
    tls_certificate: &Path,
    tls_private_key: &Path,
) -> anyhow::Result<Arc<ServerConfig>> {
    let cert_data = std::fs::read(tls_certificate)
        .with_context(|| format!("reading certificate from {}", tls_certificate.display()))?;
    let certificates = load_certs(&cert_data)
        .with_context(|| format!("loading certificates from {}", tls_certificate.display()))?;

    let key_data = std::fs::read(tls_private_key)
        .with_context(|| format!("reading private key from {}", tls_private_key.display()))?;
    let private_key = load_private_key(&key_data)
        .with_context(|| format!("loading private key from {}", tls_private_key.display()))?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}

fn load_certs(data: &[u8]) -> anyhow::Result<Vec<rustls::Certificate>> {
    let mut reader = std::io::BufReader::new(data);
    Ok(rustls_pemfile::certs(&mut reader)
        .context("reading PEM encoded certificates")?
        .iter()
        .map(|v| rustls::Certificate(v.clone()))
        .collect())
}

fn load_private_key(data: &[u8]) -> anyhow::Result<rustls::PrivateKey> {
    let mut reader = std::io::BufReader::new(data);

    while let Some(item) =
        rustls_pemfile::read_one(&mut reader).context("cannot parse private key PEM")?
    {
        match item {
            rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(rustls::PrivateKey(key)),
            _ => {}
        }
    }

    anyhow::bail!("no keys found in key data (encrypted keys not supported)");
}

/// Human-readable description of a negotiated session, for the
/// `(using ...)` clause of the Received header.
pub fn security_string(conn: &rustls::ServerConnection) -> String {
    let version = conn
        .protocol_version()
        .and_then(|v| v.as_str())
        .unwrap_or("UNKNOWN");
    let cipher = conn
        .negotiated_cipher_suite()
        .and_then(|suite| suite.suite().as_str())
        .unwrap_or("UNKNOWN");
    format!("{version} with cipher {cipher}")
}
