//! TLS material for the broker connection.

use std::path::Path;

use crate::config::BrokerTlsConfig;

/// PEM-encoded CA bundle, client certificate chain and private key.
#[derive(Clone)]
pub struct TlsMaterial {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    /// Number of certificates found in the CA bundle.
    pub ca_certificates: usize,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_certificates", &self.ca_certificates)
            .field("cert_bytes", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// Read and sanity-check TLS files. Returns `None` when TLS is disabled.
pub async fn load_tls_material(config: &BrokerTlsConfig) -> Result<Option<TlsMaterial>, String> {
    if !config.enabled {
        return Ok(None);
    }

    let (ca_path, cert_path, key_path) = match (&config.ca_path, &config.cert_path, &config.key_path)
    {
        (Some(ca), Some(cert), Some(key)) => (ca, cert, key),
        _ => return Err("TLS enabled but ca_path, cert_path and key_path are not all set".into()),
    };

    let ca_pem = read_pem(Path::new(ca_path), "CA bundle").await?;
    let cert_pem = read_pem(Path::new(cert_path), "certificate").await?;
    let key_pem = read_pem(Path::new(key_path), "private key").await?;

    let ca_certificates = count_certificates(&ca_pem)
        .map_err(|e| format!("Invalid CA bundle {}: {}", ca_path, e))?;
    if ca_certificates == 0 {
        return Err(format!("No certificates found in CA bundle {}", ca_path));
    }
    if count_certificates(&cert_pem).map_err(|e| format!("Invalid certificate {}: {}", cert_path, e))?
        == 0
    {
        return Err(format!("No certificates found in {}", cert_path));
    }
    match rustls_pemfile::private_key(&mut key_pem.as_slice()) {
        Ok(Some(_)) => {}
        Ok(None) => return Err(format!("No private key found in {}", key_path)),
        Err(e) => return Err(format!("Invalid private key {}: {}", key_path, e)),
    }

    tracing::debug!(ca_certificates, "Loaded broker TLS material");

    Ok(Some(TlsMaterial {
        ca_pem,
        cert_pem,
        key_pem,
        ca_certificates,
    }))
}

async fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>, String> {
    if !path.exists() {
        return Err(format!("TLS {} not found: {:?}", what, path));
    }
    tokio::fs::read(path)
        .await
        .map_err(|e| format!("Failed to read TLS {} {:?}: {}", what, path, e))
}

fn count_certificates(pem: &[u8]) -> Result<usize, std::io::Error> {
    let mut reader = pem;
    let mut count = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        cert?;
        count += 1;
    }
    Ok(count)
}
