//! Certificate loading for the HTTPS listener.

use std::io::{Error, ErrorKind};
use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

use crate::config::ListenerTlsConfig;

/// Read the PEM certificate chain and key, rejecting files that hold neither.
pub async fn load_tls_config(config: &ListenerTlsConfig) -> Result<RustlsConfig, Error> {
    let cert = read(Path::new(&config.cert_path), "Certificate").await?;
    let key = read(Path::new(&config.key_path), "Private key").await?;

    let certificates = rustls_pemfile::certs(&mut cert.as_slice())
        .collect::<Result<Vec<_>, _>>()?
        .len();
    if certificates == 0 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("No certificates found in {}", config.cert_path),
        ));
    }
    if rustls_pemfile::private_key(&mut key.as_slice())?.is_none() {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("No private key found in {}", config.key_path),
        ));
    }

    tracing::debug!(certificates, cert_path = %config.cert_path, "Loaded listener certificate");
    RustlsConfig::from_pem(cert, key).await
}

async fn read(path: &Path, what: &str) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::new(
            ErrorKind::NotFound,
            format!("{} file not found: {:?}", what, path),
        ),
        _ => e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_certificate() {
        let config = ListenerTlsConfig {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: "/nonexistent/key.pem".to_string(),
        };
        let err = load_tls_config(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("Certificate file not found"));
    }

    #[tokio::test]
    async fn test_file_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not pem\n").unwrap();
        let path = path.to_string_lossy().into_owned();

        let config = ListenerTlsConfig {
            cert_path: path.clone(),
            key_path: path,
        };
        let err = load_tls_config(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
