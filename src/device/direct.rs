//! Direct Allocator
//!
//! Every device is its own fsdax namespace, named after the volume. Sizes are
//! rounded up to the namespace alignment, so very small volumes waste space.

use super::exec::CommandRunner;
use super::ndctl::{self, Namespace, NAMESPACE_ALIGNMENT, POOL_NAMESPACE_NAME};
use super::util::{clear_device, prepare_device};
use super::{DeviceManager, DeviceMode, PmemDeviceInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Allocator with one namespace per device
pub struct DirectDeviceManager {
    runner: Arc<dyn CommandRunner>,
}

impl DirectDeviceManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Named fsdax namespaces except the ones backing an LVM pool
    async fn volume_namespaces(&self) -> Result<Vec<Namespace>> {
        let regions = ndctl::list_regions(self.runner.as_ref()).await?;
        Ok(regions
            .into_iter()
            .flat_map(|r| r.namespaces)
            .filter(|ns| ns.mode == "fsdax")
            .filter(|ns| matches!(ns.name.as_deref(), Some(n) if !n.is_empty() && n != POOL_NAMESPACE_NAME))
            .collect())
    }

    async fn find_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self
            .volume_namespaces()
            .await?
            .into_iter()
            .find(|ns| ns.name.as_deref() == Some(name)))
    }
}

fn device_info(namespace: &Namespace) -> Option<PmemDeviceInfo> {
    Some(PmemDeviceInfo {
        volume_id: namespace.name.clone()?,
        path: namespace.device_path()?,
        size: namespace.size,
    })
}

#[async_trait]
impl DeviceManager for DirectDeviceManager {
    fn mode(&self) -> DeviceMode {
        DeviceMode::Direct
    }

    async fn get_capacity(&self) -> Result<u64> {
        let regions = ndctl::list_regions(self.runner.as_ref()).await?;
        Ok(regions
            .iter()
            .map(|r| ndctl::align_down(r.available_size, NAMESPACE_ALIGNMENT))
            .max()
            .unwrap_or(0))
    }

    async fn create_device(&self, name: &str, size: u64) -> Result<()> {
        if name.is_empty() || size == 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid device name {:?} or size {}",
                name, size
            )));
        }
        let aligned = ndctl::align_up(size, NAMESPACE_ALIGNMENT).ok_or_else(|| {
            Error::InvalidArgument(format!("device size {} out of range", size))
        })?;

        let regions = ndctl::list_regions(self.runner.as_ref()).await?;
        let exists = regions
            .iter()
            .flat_map(|r| r.namespaces.iter())
            .any(|ns| ns.name.as_deref() == Some(name));
        if exists {
            return Err(Error::DeviceExists {
                name: name.to_string(),
            });
        }

        // Best fit: the region with the least usable space that still fits
        let usable = |available: u64| ndctl::align_down(available, NAMESPACE_ALIGNMENT);
        let region = regions
            .iter()
            .filter(|r| usable(r.available_size) >= aligned)
            .min_by_key(|r| r.available_size)
            .ok_or_else(|| Error::NotEnoughSpace {
                requested: aligned,
                available: regions
                    .iter()
                    .map(|r| usable(r.available_size))
                    .max()
                    .unwrap_or(0),
            })?;

        info!(
            "Creating namespace {} ({} bytes) in {}",
            name, aligned, region.dev
        );
        let namespace =
            ndctl::create_namespace(self.runner.as_ref(), &region.dev, aligned, name).await?;
        let prepared = match device_info(&namespace) {
            Some(device) => prepare_device(self.runner.as_ref(), &device).await,
            None => Err(Error::Command {
                command: "ndctl create-namespace".into(),
                reason: format!("namespace {} has no block device", namespace.dev),
            }),
        };
        if let Err(e) = prepared {
            // An uncleared namespace must not survive for a retry to pick up
            warn!("Destroying namespace {} after failed setup: {}", namespace.dev, e);
            if let Err(destroy_err) =
                ndctl::destroy_namespace(self.runner.as_ref(), &namespace.dev).await
            {
                error!("Failed to destroy namespace {}: {}", namespace.dev, destroy_err);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn reclaim_device(&self, name: &str) -> Result<PmemDeviceInfo> {
        let device = self.get_device(name).await?;
        prepare_device(self.runner.as_ref(), &device).await?;
        Ok(device)
    }

    async fn get_device(&self, name: &str) -> Result<PmemDeviceInfo> {
        self.find_namespace(name)
            .await?
            .as_ref()
            .and_then(device_info)
            .ok_or_else(|| Error::DeviceNotFound {
                name: name.to_string(),
            })
    }

    async fn delete_device(&self, name: &str, flush: bool) -> Result<()> {
        let Some(namespace) = self.find_namespace(name).await? else {
            return Ok(());
        };

        if let Some(device) = device_info(&namespace) {
            clear_device(self.runner.as_ref(), &device, flush).await?;
        }
        info!("Destroying namespace {} of {}", namespace.dev, name);
        ndctl::destroy_namespace(self.runner.as_ref(), &namespace.dev).await
    }

    async fn list_devices(&self) -> Result<Vec<PmemDeviceInfo>> {
        Ok(self
            .volume_namespaces()
            .await?
            .iter()
            .filter_map(device_info)
            .collect())
    }
}
