//! Node Registration Protocol
//!
//! A node agent announces its controller endpoint to the registry and keeps
//! that announcement alive:
//!
//! ```text
//! Unregistered -> Registering -> Registered -> ConnectionLost -> Reconnecting
//!                                    ^                                |
//!                                    +--------------------------------+
//! Registered -> Unregistering -> Unregistered
//! ```
//!
//! Registration retries forever with a fixed interval; only an explicit
//! invalid-argument reply from the registry ends it. Once registered, a
//! watcher polls the registry connection and registers again whenever the
//! connection comes back after a loss, which repopulates a restarted
//! registry without restarting the node.

use crate::client::{ConnectivityState, RegistryClient};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::backoff::Constant;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Pause between two registration attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Pause between two connectivity checks of the watcher
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// Registry Port
// =============================================================================

/// The registry as seen by a node agent
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn register_controller(&self, node_id: &str, endpoint: &str) -> Result<()>;

    async fn unregister_controller(&self, node_id: &str) -> Result<()>;

    /// Current state of the connection to the registry
    async fn connectivity(&self) -> ConnectivityState;
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn register_controller(&self, node_id: &str, endpoint: &str) -> Result<()> {
        RegistryClient::register_controller(self, node_id, endpoint).await
    }

    async fn unregister_controller(&self, node_id: &str) -> Result<()> {
        RegistryClient::unregister_controller(self, node_id).await
    }

    async fn connectivity(&self) -> ConnectivityState {
        RegistryClient::connectivity(self).await
    }
}

// =============================================================================
// State
// =============================================================================

/// Registration state of a node agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    ConnectionLost,
    Reconnecting,
    Unregistering,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "unregistered"),
            RegistrationState::Registering => write!(f, "registering"),
            RegistrationState::Registered => write!(f, "registered"),
            RegistrationState::ConnectionLost => write!(f, "connection_lost"),
            RegistrationState::Reconnecting => write!(f, "reconnecting"),
            RegistrationState::Unregistering => write!(f, "unregistering"),
        }
    }
}

/// Timing of the registration protocol
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub retry_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

// =============================================================================
// Node Registrar
// =============================================================================

/// Keeps one node controller registered with the registry
pub struct NodeRegistrar {
    api: Arc<dyn RegistryApi>,
    node_id: String,
    endpoint: String,
    config: RegistrationConfig,
    state: RwLock<RegistrationState>,
    /// Cancels registration attempts and the watcher on shutdown
    token: CancellationToken,
    /// Scope of the running watcher
    watcher: Mutex<Option<CancellationToken>>,
}

impl NodeRegistrar {
    pub fn new(
        api: Arc<dyn RegistryApi>,
        node_id: impl Into<String>,
        endpoint: impl Into<String>,
        config: RegistrationConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            api,
            node_id: node_id.into(),
            endpoint: endpoint.into(),
            config,
            state: RwLock::new(RegistrationState::Unregistered),
            token,
            watcher: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.read()
    }

    fn set_state(&self, state: RegistrationState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!("Node {} registration: {} -> {}", self.node_id, previous, state);
        }
    }

    /// Register with the registry, retrying until it succeeds.
    ///
    /// Fails on an invalid-argument reply or when the registrar is
    /// cancelled.
    pub async fn register(&self) -> Result<()> {
        self.set_state(RegistrationState::Registering);
        match self.register_until_done(&self.token).await {
            Ok(()) => {
                info!(
                    "Registered node controller {} at {}",
                    self.node_id, self.endpoint
                );
                self.set_state(RegistrationState::Registered);
                Ok(())
            }
            Err(e) => {
                self.set_state(RegistrationState::Unregistered);
                Err(e)
            }
        }
    }

    async fn register_until_done(&self, token: &CancellationToken) -> Result<()> {
        let api = &self.api;
        let node_id = self.node_id.as_str();
        let endpoint = self.endpoint.as_str();

        let attempt = move || async move {
            api.register_controller(node_id, endpoint)
                .await
                .map_err(|e| {
                    if e.is_invalid_argument() {
                        backoff::Error::permanent(e)
                    } else {
                        backoff::Error::transient(e)
                    }
                })
        };
        let notify = |e: Error, wait: Duration| {
            warn!(
                "Failed to register node controller {}: {}; retrying in {:?}",
                node_id, e, wait
            );
        };

        let retry = backoff::future::retry_notify(
            Constant::new(self.config.retry_interval),
            attempt,
            notify,
        );
        tokio::select! {
            result = retry => result.map_err(|e| {
                error!("Registration of node controller {} rejected: {}", node_id, e);
                e
            }),
            _ = token.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Start watching the registry connection in the background
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let scope = self.token.child_token();
        if let Some(old) = self.watcher.lock().replace(scope.clone()) {
            old.cancel();
        }
        let registrar = self.clone();
        tokio::spawn(async move {
            registrar.watch(&scope).await;
            scope.cancel();
        })
    }

    async fn watch(&self, scope: &CancellationToken) {
        info!("Watching registry connection of node {}", self.node_id);
        let mut connection_lost = false;

        loop {
            let state = tokio::select! {
                _ = scope.cancelled() => break,
                state = self.next_connectivity() => state,
            };

            if !state.is_ready() {
                if !connection_lost {
                    warn!("Registry connection of node {} is {}", self.node_id, state);
                    connection_lost = true;
                    self.set_state(RegistrationState::ConnectionLost);
                }
                continue;
            }

            if connection_lost {
                info!(
                    "Registry connection of node {} is back, registering again",
                    self.node_id
                );
                self.set_state(RegistrationState::Reconnecting);
                match self.register_until_done(scope).await {
                    Ok(()) => self.set_state(RegistrationState::Registered),
                    Err(Error::Cancelled) => break,
                    Err(e) => {
                        warn!("Re-registration of node {} failed: {}", self.node_id, e);
                        self.set_state(RegistrationState::Unregistered);
                    }
                }
                connection_lost = false;
            }
        }
        debug!("Registry watcher of node {} stopped", self.node_id);
    }

    async fn next_connectivity(&self) -> ConnectivityState {
        tokio::time::sleep(self.config.poll_interval).await;
        self.api.connectivity().await
    }

    /// Stop the watcher and unregister once; failures are only logged
    pub async fn unregister(&self) {
        if let Some(scope) = self.watcher.lock().take() {
            scope.cancel();
        }
        self.set_state(RegistrationState::Unregistering);
        match self.api.unregister_controller(&self.node_id).await {
            Ok(()) => info!("Unregistered node controller {}", self.node_id),
            Err(e) => warn!("Failed to unregister node controller {}: {}", self.node_id, e),
        }
        self.set_state(RegistrationState::Unregistered);
    }
}
