//! Node Controller Registry
//!
//! Maps node IDs to the endpoints of their node controllers. All mutations
//! are synchronous and guarded by one mutex; no network I/O happens while
//! registering. Dialing a node only reads the map.

use super::events::RegistryEvent;
use crate::client::{ClientTlsConfig, Connection};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A registered node controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    pub endpoint: String,
    /// Time of the most recent registration
    pub registered_at: DateTime<Utc>,
}

/// In-memory registry of node controllers
pub struct Registry {
    nodes: Mutex<HashMap<String, NodeInfo>>,
    /// TLS material for dialing node controllers
    tls: ClientTlsConfig,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    pub fn new(tls: ClientTlsConfig) -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            nodes: Mutex::new(HashMap::new()),
            tls,
            event_sender,
        }
    }

    /// Subscribe to registration changes
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.event_sender.send(event);
    }

    /// Add or replace the endpoint of a node controller
    pub fn register_controller(&self, node_id: &str, endpoint: &str) -> Result<()> {
        if node_id.is_empty() {
            return Err(Error::InvalidArgument("Missing NodeId parameter".into()));
        }
        if endpoint.is_empty() {
            return Err(Error::InvalidArgument("Missing endpoint address".into()));
        }

        let info = NodeInfo {
            node_id: node_id.to_string(),
            endpoint: endpoint.to_string(),
            registered_at: Utc::now(),
        };
        let previous = self.nodes.lock().insert(node_id.to_string(), info);
        match previous {
            Some(old) if old.endpoint != endpoint => info!(
                "Node controller {} moved from {} to {}",
                node_id, old.endpoint, endpoint
            ),
            Some(_) => debug!("Node controller {} re-registered", node_id),
            None => info!("Registered node controller {} at {}", node_id, endpoint),
        }

        self.emit(RegistryEvent::ControllerRegistered {
            node_id: node_id.to_string(),
            endpoint: endpoint.to_string(),
        });
        Ok(())
    }

    /// Remove a node controller
    pub fn unregister_controller(&self, node_id: &str) -> Result<()> {
        if node_id.is_empty() {
            return Err(Error::InvalidArgument("Missing NodeId parameter".into()));
        }
        if self.nodes.lock().remove(node_id).is_none() {
            return Err(Error::NodeNotFound {
                node_id: node_id.to_string(),
            });
        }

        info!("Unregistered node controller {}", node_id);
        self.emit(RegistryEvent::ControllerUnregistered {
            node_id: node_id.to_string(),
        });
        Ok(())
    }

    /// Look up a node controller
    pub fn get_node_controller(&self, node_id: &str) -> Result<NodeInfo> {
        self.nodes
            .lock()
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound {
                node_id: node_id.to_string(),
            })
    }

    /// Dial the controller of a registered node.
    ///
    /// An unregistered node is reported as [`Error::NodeNotFound`] without
    /// any network traffic.
    pub async fn connect_to_node_controller(
        &self,
        node_id: &str,
        timeout: Duration,
    ) -> Result<Connection> {
        let node = self.get_node_controller(node_id)?;
        debug!("Connecting to node controller {} at {}", node_id, node.endpoint);
        Connection::connect(&node.endpoint, &self.tls, timeout).await
    }

    /// All registered node controllers, ordered by node ID
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.lock().values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(ClientTlsConfig::default())
    }
}
