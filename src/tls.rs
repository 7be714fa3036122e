//! Client-side mTLS material for the connection to the cluster manager.
//!
//! The worker presents its own certificate and verifies the manager against
//! the cluster CA. PEM contents are handed to tonic as-is and only parsed
//! when the channel is built.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

use crate::config::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS enabled but no CA certificate configured (--ca-cert)")]
    MissingCaCert,

    #[error("TLS enabled but no worker certificate configured (--cert)")]
    MissingCert,

    #[error("TLS enabled but no worker key configured (--key)")]
    MissingKey,

    #[error("CA certificate {0} does not exist")]
    CaCertNotFound(PathBuf),

    #[error("worker certificate {0} does not exist")]
    CertNotFound(PathBuf),

    #[error("worker key {0} does not exist")]
    KeyNotFound(PathBuf),

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Worker identity plus the CA that signs the manager certificate.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
    domain_name: String,
}

impl TlsIdentity {
    /// Read the PEM files named by `config`.
    ///
    /// # Errors
    ///
    /// All three paths must be configured; the first unset one is reported
    /// before any file is touched. Files are then read CA first.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_path = configured(&config.ca_cert_path, TlsError::MissingCaCert)?;
        let cert_path = configured(&config.cert_path, TlsError::MissingCert)?;
        let key_path = configured(&config.key_path, TlsError::MissingKey)?;

        let ca_pem = read_pem(ca_path, TlsError::CaCertNotFound).await?;
        let cert_pem = read_pem(cert_path, TlsError::CertNotFound).await?;
        let key_pem = read_pem(key_path, TlsError::KeyNotFound).await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
            domain_name: config.domain_name().to_string(),
        })
    }

    /// Resolve the TLS identity the worker should connect with.
    ///
    /// Returns `None` for plaintext. A TLS request that cannot be satisfied
    /// is an error unless `allow_insecure` is set, in which case it degrades
    /// to plaintext with a warning.
    pub async fn resolve(config: &TlsConfig) -> Result<Option<Self>, TlsError> {
        if !config.enabled {
            return Ok(None);
        }

        match Self::load(config).await {
            Ok(identity) => {
                tracing::info!(domain = %identity.domain_name, "TLS enabled with mTLS authentication");
                Ok(Some(identity))
            }
            Err(e) if config.allow_insecure => {
                tracing::warn!(error = %e, "TLS material unavailable, connecting in insecure mode");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn domain_name(&self) -> &str {
        &self.domain_name
    }

    /// Client config presenting this worker's certificate and trusting only
    /// the cluster CA.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(self.domain_name.clone())
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

fn configured(path: &Option<PathBuf>, missing: TlsError) -> Result<&Path, TlsError> {
    path.as_deref().ok_or(missing)
}

async fn read_pem(path: &Path, not_found: fn(PathBuf) -> TlsError) -> Result<Vec<u8>, TlsError> {
    match fs::read(path).await {
        Ok(pem) => Ok(pem),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found(path.to_path_buf())),
        Err(source) => Err(TlsError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}
