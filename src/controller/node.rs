//! Node Controller
//!
//! Creates and deletes the devices backing volumes on this node. Every
//! volume is persisted in a [`FileState`] so that it survives a restart of
//! the node agent. Work on one volume ID is serialized; different volumes
//! proceed concurrently.

use super::state::FileState;
use super::volume_id_for;
use crate::api::types::{NodeCreateVolumeRequest, VolumeInfo};
use crate::device::DeviceManager;
use crate::error::{Error, Result};
use crate::parameters::{self, Origin, Volume};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Per-node volume controller
pub struct NodeController {
    node_id: String,
    device_manager: Arc<dyn DeviceManager>,
    state: FileState,
    volumes: DashMap<String, VolumeInfo>,
    /// One lock per volume ID
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl NodeController {
    /// Create the controller and load the volumes persisted by an earlier
    /// run
    pub async fn new(
        node_id: impl Into<String>,
        device_manager: Arc<dyn DeviceManager>,
        state: FileState,
    ) -> Result<Self> {
        let controller = Self {
            node_id: node_id.into(),
            device_manager,
            state,
            volumes: DashMap::new(),
            locks: DashMap::new(),
        };
        controller.reload().await?;
        Ok(controller)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn reload(&self) -> Result<()> {
        for (id, context) in self.state.get_all().await? {
            if let Err(e) = parameters::parse(Origin::NodeVolume, &context) {
                warn!("Dropping volume {} with invalid state: {}", id, e);
                self.state.delete(&id).await?;
                continue;
            }
            match self.device_manager.get_device(&id).await {
                Ok(device) => {
                    debug!("Restored volume {} ({})", id, device.path);
                    self.volumes.insert(
                        id.clone(),
                        VolumeInfo {
                            volume_id: id,
                            capacity_bytes: device.size,
                            volume_context: context,
                            nodes: vec![self.node_id.clone()],
                        },
                    );
                }
                Err(Error::DeviceNotFound { .. }) => {
                    warn!("Dropping volume {}: device is gone", id);
                    self.state.delete(&id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            "Node controller {} manages {} volumes",
            self.node_id,
            self.volumes.len()
        );
        Ok(())
    }

    fn lock(&self, volume_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(volume_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Allocate the device for a volume and persist it.
    ///
    /// Repeating a request with the same size returns the existing volume.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_volume(&self, request: &NodeCreateVolumeRequest) -> Result<VolumeInfo> {
        if request.name.is_empty() {
            return Err(Error::InvalidArgument("Volume name missing in request".into()));
        }
        if request.capacity_bytes == 0 {
            return Err(Error::InvalidArgument("Volume size missing in request".into()));
        }
        let size = i64::try_from(request.capacity_bytes).map_err(|_| {
            Error::InvalidArgument(format!("volume size {} too large", request.capacity_bytes))
        })?;

        let volume = parameters::parse(Origin::CreateVolumeInternal, &request.parameters)?;
        let volume_id = match volume.volume_id() {
            "" => volume_id_for(&request.name),
            id => id.to_string(),
        };

        let lock = self.lock(&volume_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.volumes.get(&volume_id) {
            if existing.capacity_bytes >= request.capacity_bytes {
                debug!("Volume {} exists already", volume_id);
                return Ok(existing.clone());
            }
            return Err(Error::VolumeExists {
                name: request.name.clone(),
            });
        }

        let device = match self
            .device_manager
            .create_device(&volume_id, request.capacity_bytes)
            .await
        {
            Ok(()) => self.device_manager.get_device(&volume_id).await?,
            // left behind by a crash before the state was written
            Err(Error::DeviceExists { .. }) => {
                warn!("Reclaiming existing device for volume {}", volume_id);
                self.device_manager.reclaim_device(&volume_id).await?
            }
            Err(e) => return Err(e),
        };
        if device.size < request.capacity_bytes {
            return Err(Error::VolumeExists {
                name: request.name.clone(),
            });
        }

        let node_volume = Volume {
            name: Some(request.name.clone()),
            size: Some(size),
            volume_id: None,
            ..volume
        };
        let context = node_volume.to_context();
        if let Err(e) = self.state.create(&volume_id, &context).await {
            warn!("Failed to persist volume {}, removing device: {}", volume_id, e);
            if let Err(e) = self
                .device_manager
                .delete_device(&volume_id, node_volume.erase_after())
                .await
            {
                warn!("Failed to remove device {}: {}", volume_id, e);
            }
            return Err(e);
        }

        let info = VolumeInfo {
            volume_id: volume_id.clone(),
            capacity_bytes: device.size,
            volume_context: context,
            nodes: vec![self.node_id.clone()],
        };
        self.volumes.insert(volume_id.clone(), info.clone());
        info!(
            "Created volume {} for {} ({} bytes at {})",
            volume_id, request.name, device.size, device.path
        );
        Ok(info)
    }

    /// Delete the device of a volume and forget it; unknown IDs succeed
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::InvalidArgument("Volume ID missing in request".into()));
        }

        let lock = self.lock(volume_id);
        let _guard = lock.lock().await;

        let erase = match self.volumes.get(volume_id) {
            Some(info) => parameters::parse(Origin::NodeVolume, &info.volume_context)
                .map(|v| v.erase_after())
                .unwrap_or(true),
            None => {
                debug!("Volume {} not known, deleting device if present", volume_id);
                true
            }
        };

        self.device_manager.delete_device(volume_id, erase).await?;
        self.state.delete(volume_id).await?;
        if self.volumes.remove(volume_id).is_some() {
            info!("Deleted volume {} (erase: {})", volume_id, erase);
        }
        Ok(())
    }

    /// All volumes of this node, ordered by ID
    pub fn list_volumes(&self) -> Vec<VolumeInfo> {
        let mut volumes: Vec<VolumeInfo> = self.volumes.iter().map(|v| v.value().clone()).collect();
        volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        volumes
    }

    /// Largest volume that can currently be created
    pub async fn get_capacity(&self) -> Result<u64> {
        self.device_manager.get_capacity().await
    }
}
