use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, WorkerError};
use crate::proto::EnrollRequest;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_LOGS_DIR: &str = "logs";
pub const DEFAULT_TLS_DOMAIN: &str = "cluster-manager";

/// TLS configuration for the connection to the cluster manager.
///
/// When enabled the worker authenticates with mutual TLS:
/// - It presents its own certificate to the manager
/// - It verifies the manager's certificate against the cluster CA
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Dial the manager over mTLS. The remaining fields only matter when set.
    pub enabled: bool,

    /// Cluster CA bundle used to verify the manager (PEM).
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this worker's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this worker's private key (PEM format).
    pub key_path: Option<PathBuf>,

    /// Domain name expected in the manager certificate.
    /// Falls back to [`DEFAULT_TLS_DOMAIN`].
    pub domain_name: Option<String>,

    /// Connect in plaintext with a warning when TLS is requested but the
    /// certificate material is missing or unreadable.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// TLS is requested and every PEM path is present.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }

    pub fn domain_name(&self) -> &str {
        self.domain_name.as_deref().unwrap_or(DEFAULT_TLS_DOMAIN)
    }
}

/// Identity announced to the manager on enrollment. Never mutated after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub worker_ip: String,
    pub max_tasks: u32,
    pub port_start: u16,
    pub port_end: u16,
}

impl WorkerIdentity {
    pub fn new(worker_id: impl Into<String>, worker_ip: impl Into<String>, max_tasks: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_ip: worker_ip.into(),
            max_tasks,
            port_start: 0,
            port_end: 0,
        }
    }

    pub fn with_ports(mut self, port_start: u16, port_end: u16) -> Self {
        self.port_start = port_start;
        self.port_end = port_end;
        self
    }
}

impl From<&WorkerIdentity> for EnrollRequest {
    fn from(identity: &WorkerIdentity) -> Self {
        EnrollRequest {
            worker_id: identity.worker_id.clone(),
            worker_ip: identity.worker_ip.clone(),
            max_tasks: identity.max_tasks,
            port_start: u32::from(identity.port_start),
            port_end: u32::from(identity.port_end),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub identity: WorkerIdentity,
    /// Manager address, `host:port` or a full `http(s)://` URI
    pub manager_addr: String,
    pub heartbeat_interval_ms: u64,
    /// Root of the per-task working directories (`<logs_dir>/jobs/<job>/<task>`)
    pub logs_dir: PathBuf,
    /// Extension manifest. `None` means only the built-in task types.
    pub extensions_path: Option<PathBuf>,
    pub tls: TlsConfig,
}

impl WorkerConfig {
    pub fn new(identity: WorkerIdentity, manager_addr: impl Into<String>) -> Self {
        Self {
            identity,
            manager_addr: manager_addr.into(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            logs_dir: PathBuf::from(DEFAULT_LOGS_DIR),
            extensions_path: None,
            tls: TlsConfig::default(),
        }
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_logs_dir(mut self, logs_dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = logs_dir.into();
        self
    }

    pub fn with_extensions_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.extensions_path = Some(path.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        let identity = &self.identity;
        if identity.worker_id.trim().is_empty() {
            return Err(WorkerError::InvalidConfig(
                "worker_id must not be empty".to_string(),
            ));
        }
        if identity.max_tasks == 0 {
            return Err(WorkerError::InvalidConfig(
                "max_tasks must be greater than zero".to_string(),
            ));
        }
        if identity.port_start > identity.port_end {
            return Err(WorkerError::InvalidConfig(format!(
                "port_start ({}) must not exceed port_end ({})",
                identity.port_start, identity.port_end
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(WorkerError::InvalidConfig(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.manager_addr.trim().is_empty() {
            return Err(WorkerError::InvalidConfig(
                "manager address must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> WorkerIdentity {
        WorkerIdentity::new("worker-1", "10.0.0.5", 4).with_ports(9000, 9010)
    }

    #[test]
    fn tls_config_default() {
        let cfg = TlsConfig::default();
        assert!(!cfg.enabled);
        assert!(cfg.ca_cert_path.is_none());
        assert!(cfg.cert_path.is_none());
        assert!(cfg.key_path.is_none());
        assert!(!cfg.allow_insecure);
        assert_eq!(cfg.domain_name(), DEFAULT_TLS_DOMAIN);
    }

    #[test]
    fn tls_config_is_not_complete_when_path_missing() {
        let base = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/ca.pem")),
            cert_path: Some(PathBuf::from("/cert.pem")),
            key_path: Some(PathBuf::from("/key.pem")),
            ..TlsConfig::default()
        };
        assert!(base.is_complete());

        let mut cfg = base.clone();
        cfg.ca_cert_path = None;
        assert!(!cfg.is_complete());

        let mut cfg = base.clone();
        cfg.key_path = None;
        assert!(!cfg.is_complete());

        let mut cfg = base;
        cfg.enabled = false;
        assert!(!cfg.is_complete());
    }

    #[test]
    fn worker_config_defaults() {
        let cfg = WorkerConfig::new(test_identity(), "127.0.0.1:10000");
        assert_eq!(cfg.heartbeat_interval_ms, 1000);
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(cfg.logs_dir, PathBuf::from("logs"));
        assert!(cfg.extensions_path.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn enroll_request_carries_identity() {
        let request = EnrollRequest::from(&test_identity());
        assert_eq!(request.worker_id, "worker-1");
        assert_eq!(request.worker_ip, "10.0.0.5");
        assert_eq!(request.max_tasks, 4);
        assert_eq!(request.port_start, 9000);
        assert_eq!(request.port_end, 9010);
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let identity = WorkerIdentity::new("worker-1", "10.0.0.5", 0);
        let cfg = WorkerConfig::new(identity, "127.0.0.1:10000");
        assert!(matches!(cfg.validate(), Err(WorkerError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_inverted_port_range() {
        let identity = WorkerIdentity::new("worker-1", "10.0.0.5", 2).with_ports(9010, 9000);
        let cfg = WorkerConfig::new(identity, "127.0.0.1:10000");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("port_start"));
    }

    #[test]
    fn validate_rejects_empty_worker_id_and_zero_heartbeat() {
        let cfg = WorkerConfig::new(WorkerIdentity::new("  ", "10.0.0.5", 2), "127.0.0.1:10000");
        assert!(cfg.validate().is_err());

        let cfg = WorkerConfig::new(test_identity(), "127.0.0.1:10000").with_heartbeat_interval_ms(0);
        assert!(cfg.validate().is_err());

        let cfg = WorkerConfig::new(test_identity(), "");
        assert!(cfg.validate().is_err());
    }
}
