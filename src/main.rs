//! PMEM-CSI Driver
//!
//! Runs either the cluster-wide controller (registry plus master
//! controller) or the per-node agent (device manager plus node controller)
//! of the persistent memory CSI driver.
//!
//! ```text
//! pmem-csi-driver --mode controller --nodeid controller --endpoint tcp://0.0.0.0:10000
//! pmem-csi-driver --mode node --nodeid $NODE --endpoint tcp://0.0.0.0:10001 \
//!     --registry-endpoint tcp://pmem-csi-controller:10000 \
//!     --controller-endpoint tcp://$POD_IP:10001 --device-manager lvm
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

use pmem_csi::{
    registration::RegistrationConfig, ClientTlsConfig, DeviceMode, DriverConfig, DriverMode,
    PmemDriver,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// PMEM-CSI - persistent memory volumes for Kubernetes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Driver mode (controller, node)
    #[arg(long, env = "PMEM_CSI_MODE", default_value = "controller")]
    mode: DriverMode,

    /// Name of the driver
    #[arg(long, env = "PMEM_CSI_DRIVER_NAME", default_value = "pmem-csi.intel.com")]
    drivername: String,

    /// Node ID
    #[arg(long, env = "KUBE_NODE_NAME")]
    nodeid: String,

    /// Listen endpoint of this process
    #[arg(long, env = "PMEM_CSI_ENDPOINT", default_value = "tcp://0.0.0.0:10000")]
    endpoint: String,

    /// Registry endpoint (served in controller mode, dialed in node mode)
    #[arg(long, env = "PMEM_CSI_REGISTRY_ENDPOINT")]
    registry_endpoint: Option<String>,

    /// Node controller endpoint advertised to the registry
    #[arg(long, env = "PMEM_CSI_CONTROLLER_ENDPOINT")]
    controller_endpoint: Option<String>,

    /// Device manager (lvm, direct, fake)
    #[arg(long, env = "PMEM_CSI_DEVICE_MANAGER", default_value = "lvm")]
    device_manager: DeviceMode,

    /// Directory for node volume state
    #[arg(long, env = "PMEM_CSI_STATE_BASE_PATH")]
    state_base_path: Option<PathBuf>,

    /// Percentage of each PMEM region used for the LVM pool
    #[arg(long, env = "PMEM_CSI_PMEM_PERCENTAGE", default_value = "100")]
    pmem_percentage: u8,

    /// CA certificate used to verify peers
    #[arg(long, env = "PMEM_CSI_CA_FILE")]
    ca_file: Option<PathBuf>,

    /// Client certificate
    #[arg(long, env = "PMEM_CSI_CLIENT_CERT_FILE")]
    client_cert_file: Option<PathBuf>,

    /// Client certificate key
    #[arg(long, env = "PMEM_CSI_CLIENT_KEY_FILE")]
    client_key_file: Option<PathBuf>,

    /// Connection timeout in seconds
    #[arg(long, env = "PMEM_CSI_CONNECTION_TIMEOUT", default_value = "10")]
    connection_timeout_secs: u64,

    /// Pause between registration attempts in seconds
    #[arg(long, env = "PMEM_CSI_REGISTRATION_RETRY", default_value = "10")]
    registration_retry_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            driver_name: self.drivername.clone(),
            node_id: self.nodeid.clone(),
            endpoint: self.endpoint.clone(),
            mode: self.mode,
            registry_endpoint: self.registry_endpoint.clone(),
            controller_endpoint: self.controller_endpoint.clone(),
            device_mode: self.device_manager,
            state_base_path: self.state_base_path.clone(),
            pmem_percentage: self.pmem_percentage,
            tls: ClientTlsConfig {
                ca_file: self.ca_file.clone(),
                cert_file: self.client_cert_file.clone(),
                key_file: self.client_key_file.clone(),
            },
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            registration: RegistrationConfig {
                retry_interval: Duration::from_secs(self.registration_retry_secs),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting PMEM-CSI driver");
    info!("  Version: {}", pmem_csi::VERSION);
    info!("  Mode: {}", args.mode);
    info!("  Node: {}", args.nodeid);
    info!("  Endpoint: {}", args.endpoint);

    let driver = PmemDriver::new(args.driver_config()).context("invalid driver configuration")?;
    if let Err(e) = driver.run().await {
        error!("Driver failed: {}", e);
        return Err(e).context(format!("{} driver", args.mode));
    }

    info!("Driver shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "axum=info", "reqwest=warn"] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
