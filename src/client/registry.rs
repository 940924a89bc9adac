//! Registry Client
//!
//! Used by node agents to announce their controller endpoint.

use super::connection::{Connection, ConnectivityState};
use crate::api::types::{Empty, RegisterControllerRequest};
use crate::error::Result;
use crate::registry::NodeInfo;
use tracing::debug;

/// Client side of the registry RPCs
#[derive(Debug, Clone)]
pub struct RegistryClient {
    connection: Connection,
}

impl RegistryClient {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn register_controller(&self, node_id: &str, endpoint: &str) -> Result<()> {
        debug!("RegisterController {} -> {}", node_id, endpoint);
        let request = RegisterControllerRequest {
            node_id: node_id.to_string(),
            endpoint: endpoint.to_string(),
        };
        let _: Empty = self
            .connection
            .post("/v1/registry/controllers", &request)
            .await?;
        Ok(())
    }

    pub async fn unregister_controller(&self, node_id: &str) -> Result<()> {
        debug!("UnregisterController {}", node_id);
        let path = format!(
            "/v1/registry/controllers/{}",
            urlencoding::encode(node_id)
        );
        let _: Empty = self.connection.delete(&path).await?;
        Ok(())
    }

    /// All registered node controllers
    pub async fn list_controllers(&self) -> Result<Vec<NodeInfo>> {
        self.connection.get("/v1/registry/controllers").await
    }

    pub async fn connectivity(&self) -> ConnectivityState {
        self.connection.connectivity().await
    }
}
