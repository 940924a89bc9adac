//! Node Controller Client
//!
//! Used by the master controller to forward volume operations to the node
//! that owns the device.

use super::connection::Connection;
use crate::api::types::{
    CapacityResponse, Empty, ListVolumesResponse, NodeCreateVolumeRequest, VolumeInfo,
};
use crate::error::Result;

/// Client side of the node controller RPCs
#[derive(Debug, Clone)]
pub struct NodeControllerClient {
    connection: Connection,
}

impl NodeControllerClient {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub async fn create_volume(&self, request: &NodeCreateVolumeRequest) -> Result<VolumeInfo> {
        self.connection.post("/v1/node/volumes", request).await
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let path = format!("/v1/node/volumes/{}", urlencoding::encode(volume_id));
        let _: Empty = self.connection.delete(&path).await?;
        Ok(())
    }

    pub async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let response: ListVolumesResponse = self.connection.get("/v1/node/volumes").await?;
        Ok(response.volumes)
    }

    pub async fn get_capacity(&self) -> Result<u64> {
        let response: CapacityResponse = self.connection.get("/v1/node/capacity").await?;
        Ok(response.available_capacity)
    }
}
