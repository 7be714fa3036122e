use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cluster_worker::config::{
    TlsConfig, WorkerConfig, WorkerIdentity, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_LOGS_DIR,
};
use cluster_worker::extensions::ExtensionRegistry;
use cluster_worker::node::WorkerNode;
use cluster_worker::shutdown::install_shutdown_handler;
use cluster_worker::tls::TlsIdentity;

#[derive(Parser, Debug)]
#[command(name = "cluster-worker")]
#[command(version)]
#[command(about = "Worker node that enrolls with a cluster manager and executes its tasks")]
struct Args {
    /// Worker ID (unique within the cluster). Defaults to a random id.
    #[arg(long)]
    worker_id: Option<String>,

    /// Address announced to the manager
    #[arg(long, default_value = "127.0.0.1")]
    worker_ip: String,

    /// Maximum number of tasks executed concurrently
    #[arg(long, default_value = "10")]
    max_tasks: u32,

    /// First port of the range reserved for tasks
    #[arg(long, default_value = "12000")]
    port_start: u16,

    /// Last port of the range reserved for tasks
    #[arg(long, default_value = "12999")]
    port_end: u16,

    /// Cluster manager address (host:port, or http(s)://host:port)
    #[arg(long, short = 'm', default_value = "127.0.0.1:10000")]
    manager_address: String,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL_MS)]
    heartbeat_interval_ms: u64,

    /// Root directory for per-task working directories and logs
    #[arg(long, default_value = DEFAULT_LOGS_DIR)]
    logs_dir: PathBuf,

    /// Extension manifest (JSON). Only built-in task types when omitted.
    #[arg(long)]
    extensions: Option<PathBuf>,

    /// Enable mutual TLS towards the manager
    #[arg(long)]
    tls: bool,

    /// Cluster CA certificate (PEM)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to worker certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to worker private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Domain name expected in the manager certificate
    #[arg(long, requires = "tls")]
    tls_domain: Option<String>,

    /// Connect in plaintext when --tls is given but certificates are unusable.
    /// Development only.
    #[arg(long)]
    allow_insecure: bool,
}

impl Args {
    fn into_config(self) -> WorkerConfig {
        let worker_id = self
            .worker_id
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
        let identity = WorkerIdentity::new(worker_id, self.worker_ip, self.max_tasks)
            .with_ports(self.port_start, self.port_end);

        let tls = TlsConfig {
            enabled: self.tls,
            ca_cert_path: self.ca_cert,
            cert_path: self.cert,
            key_path: self.key,
            domain_name: self.tls_domain,
            allow_insecure: self.allow_insecure,
        };

        let mut config = WorkerConfig::new(identity, self.manager_address)
            .with_heartbeat_interval_ms(self.heartbeat_interval_ms)
            .with_logs_dir(self.logs_dir)
            .with_tls(tls);
        if let Some(path) = self.extensions {
            config = config.with_extensions_path(path);
        }
        config
    }
}

async fn run(config: WorkerConfig) -> Result<bool, Box<dyn std::error::Error>> {
    config.validate()?;

    let registry = match &config.extensions_path {
        Some(path) => ExtensionRegistry::builder()
            .with_builtin_loaders()
            .manifest_file(path)
            .build(),
        None => ExtensionRegistry::builtin(),
    };
    // Fail fast on a broken manifest instead of on the first delivery.
    let task_types = registry.task_types().await?;

    if config.tls.enabled && !config.tls.is_complete() {
        tracing::warn!("TLS enabled but --ca-cert, --cert and --key are not all set");
    }
    let tls_identity = TlsIdentity::resolve(&config.tls).await?;

    tracing::info!(
        worker_id = %config.identity.worker_id,
        worker_ip = %config.identity.worker_ip,
        max_tasks = config.identity.max_tasks,
        ports = %format!("{}-{}", config.identity.port_start, config.identity.port_end),
        manager = %config.manager_addr,
        tls_enabled = tls_identity.is_some(),
        task_types = ?task_types,
        "Starting cluster worker"
    );

    let mut node = WorkerNode::new(config, Arc::new(registry)).with_tls_identity(tls_identity);
    install_shutdown_handler(node.stop_signal())?;

    if let Err(e) = node.start().await {
        node.stop().await;
        return Err(e.into());
    }

    let cause = node.wait_for_termination().await;
    node.stop().await;

    match cause {
        Some(e) => {
            tracing::error!(error = %e, "Worker terminated");
            Ok(false)
        }
        None => {
            tracing::info!("Worker stopped");
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();

    match run(config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed to start");
            ExitCode::FAILURE
        }
    }
}
