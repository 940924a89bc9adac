//! In-Memory Device Manager
//!
//! Tracks devices in a map against a fixed capacity. Paths are synthetic and
//! nothing is ever written, so "erase" only updates bookkeeping.

use super::{DeviceManager, DeviceMode, PmemDeviceInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

/// Device manager backed by a map instead of hardware
#[derive(Debug)]
pub struct FakeDeviceManager {
    capacity: u64,
    devices: Mutex<BTreeMap<String, PmemDeviceInfo>>,
}

impl FakeDeviceManager {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    fn used(devices: &BTreeMap<String, PmemDeviceInfo>) -> u64 {
        devices.values().map(|d| d.size).sum()
    }
}

#[async_trait]
impl DeviceManager for FakeDeviceManager {
    fn mode(&self) -> DeviceMode {
        DeviceMode::Fake
    }

    async fn get_capacity(&self) -> Result<u64> {
        let devices = self.devices.lock();
        Ok(self.capacity.saturating_sub(Self::used(&devices)))
    }

    async fn create_device(&self, name: &str, size: u64) -> Result<()> {
        if name.is_empty() || size == 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid device name {:?} or size {}",
                name, size
            )));
        }

        let mut devices = self.devices.lock();
        if devices.contains_key(name) {
            return Err(Error::DeviceExists {
                name: name.to_string(),
            });
        }
        let available = self.capacity.saturating_sub(Self::used(&devices));
        if size > available {
            return Err(Error::NotEnoughSpace {
                requested: size,
                available,
            });
        }

        debug!("Fake device created: {} ({} bytes)", name, size);
        devices.insert(
            name.to_string(),
            PmemDeviceInfo {
                volume_id: name.to_string(),
                path: format!("/dev/fake/{}", name),
                size,
            },
        );
        Ok(())
    }

    async fn get_device(&self, name: &str) -> Result<PmemDeviceInfo> {
        self.devices
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                name: name.to_string(),
            })
    }

    async fn reclaim_device(&self, name: &str) -> Result<PmemDeviceInfo> {
        self.get_device(name).await
    }

    async fn delete_device(&self, name: &str, flush: bool) -> Result<()> {
        if self.devices.lock().remove(name).is_some() {
            debug!("Fake device deleted: {} (flush: {})", name, flush);
        }
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<PmemDeviceInfo>> {
        Ok(self.devices.lock().values().cloned().collect())
    }
}
