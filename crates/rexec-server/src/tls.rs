use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::crypto::ring;

/// Build an acceptor from PEM files on disk.
pub fn load_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(cert)
        .with_context(|| format!("failed to read certificate {}", cert.display()))?;
    let key_pem =
        std::fs::read(key).with_context(|| format!("failed to read private key {}", key.display()))?;
    acceptor_from_pem(&cert_pem, &key_pem)
}

pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid certificate PEM")?;
    if certs.is_empty() {
        return Err(anyhow!("no certificate found in PEM input"));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .context("invalid private key PEM")?
        .ok_or_else(|| anyhow!("no private key found in PEM input"))?;

    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .context("no usable TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate and key do not match")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_generated_pair() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate cert");
        let cert = generated.cert.pem();
        let key = generated.key_pair.serialize_pem();
        acceptor_from_pem(cert.as_bytes(), key.as_bytes()).expect("acceptor");
    }

    #[test]
    fn rejects_missing_key() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate cert");
        let cert = generated.cert.pem();
        let err = acceptor_from_pem(cert.as_bytes(), b"")
            .err()
            .expect("missing key is rejected");
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn missing_files_name_the_path() {
        let err = load_acceptor(Path::new("/no/cert.pem"), Path::new("/no/key.pem"))
            .err()
            .expect("missing files are rejected");
        assert!(err.to_string().contains("/no/cert.pem"));
    }
}
