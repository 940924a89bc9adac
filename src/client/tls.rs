//! Client TLS Configuration
//!
//! PEM files for the CA that signs peer certificates and for our own client
//! identity. Loading happens once per client build.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// TLS material used when dialing the registry or a node controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTlsConfig {
    /// CA certificate used to verify the peer
    pub ca_file: Option<PathBuf>,
    /// Client certificate
    pub cert_file: Option<PathBuf>,
    /// Private key of the client certificate
    pub key_file: Option<PathBuf>,
}

impl ClientTlsConfig {
    /// No TLS material configured
    pub fn is_empty(&self) -> bool {
        self.ca_file.is_none() && self.cert_file.is_none() && self.key_file.is_none()
    }

    /// Install root certificate and client identity into a client builder
    pub fn apply(&self, mut builder: reqwest::ClientBuilder) -> Result<reqwest::ClientBuilder> {
        if self.is_empty() {
            return Ok(builder);
        }
        builder = builder.use_rustls_tls();

        if let Some(ca_file) = &self.ca_file {
            let pem = read_pem(ca_file)?;
            let ca = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                Error::Configuration(format!("invalid CA certificate {}: {}", ca_file.display(), e))
            })?;
            builder = builder.add_root_certificate(ca);
        }

        match (&self.cert_file, &self.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let mut pem = read_pem(cert_file)?;
                pem.push(b'\n');
                pem.extend(read_pem(key_file)?);
                let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                    Error::Configuration(format!(
                        "invalid client certificate {}: {}",
                        cert_file.display(),
                        e
                    ))
                })?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(Error::Configuration(
                    "client certificate and key must be given together".into(),
                ))
            }
        }
        Ok(builder)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::Configuration(format!("failed to read {}: {}", path.display(), e)))
}
