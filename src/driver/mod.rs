//! Driver Module
//!
//! Wires the pieces together for one process. In `controller` mode the
//! process hosts the registry and the master controller; in `node` mode it
//! owns a device manager and a node controller and keeps itself registered
//! with the registry until shutdown.

pub mod config;

pub use config::{DriverConfig, DriverMode};

use crate::api::{listen_addr, ApiServer, ApiState};
use crate::client::{Connection, RegistryClient};
use crate::controller::{FileState, MasterController, NodeController};
use crate::device::{new_device_manager, DeviceManagerConfig};
use crate::error::{Error, Result};
use crate::registration::NodeRegistrar;
use crate::registry::Registry;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A configured driver process
pub struct PmemDriver {
    config: DriverConfig,
}

impl PmemDriver {
    /// Validate the configuration and fill in defaults
    pub fn new(config: DriverConfig) -> Result<Self> {
        Ok(Self {
            config: config.validate()?,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Run until Ctrl-C or SIGTERM
    pub async fn run(&self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` completes
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            "Starting {} version {} in {} mode on node {}",
            self.config.driver_name,
            crate::VERSION,
            self.config.mode,
            self.config.node_id
        );
        match self.config.mode {
            DriverMode::Controller => self.run_controller(shutdown).await,
            DriverMode::Node => self.run_node(shutdown).await,
        }
    }

    // =========================================================================
    // Controller Mode
    // =========================================================================

    async fn run_controller<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let token = CancellationToken::new();
        let registry = Arc::new(Registry::new(self.config.tls.clone()));
        let master = Arc::new(MasterController::new(
            registry.clone(),
            self.config.connection_timeout,
        ));
        let events = master.spawn_event_loop(token.child_token());

        let master_addr = listen_addr(&self.config.endpoint)?;
        let registry_addr = listen_addr(self.config.registry_endpoint())?;

        let mut servers = Vec::new();
        if master_addr == registry_addr {
            servers.push(
                ApiServer::bind(
                    master_addr,
                    ApiState {
                        registry: Some(registry),
                        master: Some(master),
                        node: None,
                    },
                )
                .await?,
            );
        } else {
            servers.push(
                ApiServer::bind(
                    registry_addr,
                    ApiState {
                        registry: Some(registry),
                        ..Default::default()
                    },
                )
                .await?,
            );
            servers.push(
                ApiServer::bind(
                    master_addr,
                    ApiState {
                        master: Some(master),
                        ..Default::default()
                    },
                )
                .await?,
            );
        }

        let result = serve_until(servers, &token, shutdown).await;
        token.cancel();
        if let Err(e) = events.await {
            warn!("Registry event loop ended abnormally: {}", e);
        }
        info!("Controller shutdown complete");
        result
    }

    // =========================================================================
    // Node Mode
    // =========================================================================

    async fn run_node<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let config = &self.config;
        let token = CancellationToken::new();

        let device_manager = new_device_manager(
            config.device_mode,
            &DeviceManagerConfig {
                pmem_percentage: config.pmem_percentage,
                fake_capacity: config.fake_capacity,
            },
        )
        .await?;
        info!("Using {} device manager", device_manager.mode());

        let state_dir = config.state_base_path.clone().ok_or_else(|| {
            Error::Configuration("node mode requires a state directory".into())
        })?;
        let state = FileState::new(state_dir).await?;
        let node = Arc::new(NodeController::new(&config.node_id, device_manager, state).await?);

        let server = ApiServer::bind(
            listen_addr(&config.endpoint)?,
            ApiState {
                node: Some(node),
                ..Default::default()
            },
        )
        .await?;

        let connection = Connection::new(
            config.registry_endpoint(),
            &config.tls,
            config.connection_timeout,
        )?;
        let registrar = Arc::new(NodeRegistrar::new(
            Arc::new(RegistryClient::new(connection)),
            &config.node_id,
            config.controller_endpoint(),
            config.registration.clone(),
            token.child_token(),
        ));

        let mut servers = JoinSet::new();
        servers.spawn(server.run(token.clone()));

        tokio::pin!(shutdown);
        let registered = tokio::select! {
            _ = &mut shutdown => false,
            result = registrar.register() => match result {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to register node controller: {}", e);
                    token.cancel();
                    join_servers(servers).await;
                    return Err(e);
                }
            },
        };

        let result = if registered {
            let watcher = registrar.spawn_watcher();
            let result = wait_for_exit(&mut servers, shutdown).await;
            registrar.unregister().await;
            if let Err(e) = watcher.await {
                warn!("Registration watcher ended abnormally: {}", e);
            }
            result
        } else {
            Ok(())
        };

        token.cancel();
        join_servers(servers).await;
        info!("Node {} shutdown complete", config.node_id);
        result
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn serve_until<F>(servers: Vec<ApiServer>, token: &CancellationToken, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let mut set = JoinSet::new();
    for server in servers {
        set.spawn(server.run(token.clone()));
    }
    let result = wait_for_exit(&mut set, shutdown).await;
    token.cancel();
    join_servers(set).await;
    result
}

/// Wait for `shutdown`, or fail early if a server stops on its own
async fn wait_for_exit<F>(servers: &mut JoinSet<Result<()>>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    tokio::select! {
        _ = shutdown => {
            info!("Shutdown requested");
            Ok(())
        }
        Some(joined) = servers.join_next() => {
            let err = match joined {
                Ok(Ok(())) => Error::Internal("API server stopped unexpectedly".into()),
                Ok(Err(e)) => e,
                Err(e) => Error::Internal(format!("API server task failed: {}", e)),
            };
            error!("{}", err);
            Err(err)
        }
    }
}

async fn join_servers(mut servers: JoinSet<Result<()>>) {
    while let Some(joined) = servers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("API server error during shutdown: {}", e),
            Err(e) => warn!("API server task failed: {}", e),
        }
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{CreateVolumeRequest, VolumeInfo};
    use crate::client::ClientTlsConfig;
    use crate::device::DeviceMode;
    use crate::registration::RegistrationConfig;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_new_rejects_incomplete_config() {
        assert!(PmemDriver::new(DriverConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_node_requires_reachable_listen_endpoint() {
        let tmp = TempDir::new().unwrap();
        let driver = PmemDriver::new(DriverConfig {
            node_id: "node-1".into(),
            endpoint: "unix:///csi/csi.sock".into(),
            mode: DriverMode::Node,
            device_mode: DeviceMode::Fake,
            state_base_path: Some(tmp.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        let err = driver.run_until(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_controller_and_node_end_to_end() {
        let controller_endpoint = format!("tcp://127.0.0.1:{}", free_port());
        let node_endpoint = format!("tcp://127.0.0.1:{}", free_port());
        let tmp = TempDir::new().unwrap();

        let controller = PmemDriver::new(DriverConfig {
            node_id: "controller".into(),
            endpoint: controller_endpoint.clone(),
            mode: DriverMode::Controller,
            ..Default::default()
        })
        .unwrap();
        let (stop_controller, controller_stopped) = oneshot::channel::<()>();
        let controller_task = tokio::spawn(async move {
            controller
                .run_until(async {
                    let _ = controller_stopped.await;
                })
                .await
        });

        let node = PmemDriver::new(DriverConfig {
            node_id: "node-1".into(),
            endpoint: node_endpoint.clone(),
            mode: DriverMode::Node,
            registry_endpoint: Some(controller_endpoint.clone()),
            device_mode: DeviceMode::Fake,
            fake_capacity: 1 << 30,
            state_base_path: Some(tmp.path().to_path_buf()),
            registration: RegistrationConfig {
                retry_interval: Duration::from_millis(50),
                poll_interval: Duration::from_millis(50),
            },
            ..Default::default()
        })
        .unwrap();
        let (stop_node, node_stopped) = oneshot::channel::<()>();
        let node_task = tokio::spawn(async move {
            node.run_until(async {
                let _ = node_stopped.await;
            })
            .await
        });

        let connection = Connection::new(
            &controller_endpoint,
            &ClientTlsConfig::default(),
            Duration::from_secs(5),
        )
        .unwrap();
        let registry = RegistryClient::new(connection.clone());
        wait_for(|| {
            let registry = registry.clone();
            async move {
                matches!(registry.list_controllers().await, Ok(nodes) if nodes.len() == 1)
            }
        })
        .await;
        let nodes = registry.list_controllers().await.unwrap();
        assert_eq!(nodes[0].node_id, "node-1");
        assert_eq!(nodes[0].endpoint, node_endpoint);

        let request = CreateVolumeRequest {
            name: "pvc-1".into(),
            capacity_bytes: 1 << 20,
            parameters: Default::default(),
            preferred_nodes: vec!["node-1".into()],
        };
        let volume: VolumeInfo = connection
            .post("/v1/controller/volumes", &request)
            .await
            .unwrap();
        assert_eq!(volume.nodes, vec!["node-1".to_string()]);
        let mut state_files = tokio::fs::read_dir(tmp.path()).await.unwrap();
        assert!(state_files.next_entry().await.unwrap().is_some());

        stop_node.send(()).unwrap();
        node_task.await.unwrap().unwrap();
        assert!(registry.list_controllers().await.unwrap().is_empty());

        stop_controller.send(()).unwrap();
        controller_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_node_shutdown_while_registry_is_down() {
        let tmp = TempDir::new().unwrap();
        let node = PmemDriver::new(DriverConfig {
            node_id: "node-1".into(),
            endpoint: format!("tcp://127.0.0.1:{}", free_port()),
            mode: DriverMode::Node,
            registry_endpoint: Some(format!("tcp://127.0.0.1:{}", free_port())),
            device_mode: DeviceMode::Fake,
            state_base_path: Some(tmp.path().to_path_buf()),
            registration: RegistrationConfig {
                retry_interval: Duration::from_millis(20),
                poll_interval: Duration::from_millis(20),
            },
            connection_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap();

        node.run_until(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();
    }
}
