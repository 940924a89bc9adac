//! Device Manager Module
//!
//! Turns physical persistent memory into named block devices. Two allocators
//! implement the [`DeviceManager`] contract:
//! - [`LvmDeviceManager`]: reserves a share of each region as a volume group
//!   and carves logical volumes out of it
//! - [`DirectDeviceManager`]: one namespace per device, no pooling
//!
//! A third, in-memory [`FakeDeviceManager`] is available for tests and for
//! nodes without PMEM hardware. Erasing and waiting for device nodes is
//! shared through the free functions in [`util`].

pub mod direct;
pub mod exec;
pub mod fake;
pub mod lvm;
pub mod ndctl;
pub mod util;

pub use direct::DirectDeviceManager;
pub use exec::{CommandRunner, HostCommandRunner};
pub use fake::FakeDeviceManager;
pub use lvm::{LvmConfig, LvmDeviceManager};

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Device Info
// =============================================================================

/// A block device managed by a [`DeviceManager`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmemDeviceInfo {
    /// Name of the device, identical to the volume ID
    pub volume_id: String,
    /// Device node path
    pub path: String,
    /// Allocated size in bytes
    pub size: u64,
}

// =============================================================================
// Device Manager Port
// =============================================================================

/// CRUD and capacity accounting over node-local PMEM block devices.
///
/// Callers must serialize create/delete for the same name; operations on
/// different names may run concurrently.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    /// Which allocator this is
    fn mode(&self) -> DeviceMode;

    /// Largest size that a single new device can currently get
    async fn get_capacity(&self) -> Result<u64>;

    /// Allocate a new device.
    ///
    /// Possible errors: [`Error::NotEnoughSpace`], [`Error::InvalidArgument`],
    /// [`Error::DeviceExists`]
    async fn create_device(&self, name: &str, size: u64) -> Result<()>;

    /// Look up a device by name.
    ///
    /// Possible errors: [`Error::DeviceNotFound`]
    async fn get_device(&self, name: &str) -> Result<PmemDeviceInfo>;

    /// Take over a device left behind by an interrupted create. The device
    /// node must show up and the start of the device is cleared before it
    /// is returned.
    ///
    /// Possible errors: [`Error::DeviceNotFound`], [`Error::DeviceNotReady`],
    /// [`Error::DeviceInUse`]
    async fn reclaim_device(&self, name: &str) -> Result<PmemDeviceInfo>;

    /// Destroy a device, overwriting all of its data first if `flush` is set.
    /// Deleting an unknown name succeeds.
    ///
    /// Possible errors: [`Error::DeviceInUse`], [`Error::Permission`]
    async fn delete_device(&self, name: &str, flush: bool) -> Result<()>;

    /// All devices created by this manager
    async fn list_devices(&self) -> Result<Vec<PmemDeviceInfo>>;
}

// =============================================================================
// Device Mode
// =============================================================================

/// Selects the allocator used on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Logical volumes carved from a pool
    #[default]
    Lvm,
    /// One namespace per device
    Direct,
    /// In-memory, for testing
    Fake,
}

impl std::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceMode::Lvm => write!(f, "lvm"),
            DeviceMode::Direct => write!(f, "direct"),
            DeviceMode::Fake => write!(f, "fake"),
        }
    }
}

impl std::str::FromStr for DeviceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lvm" => Ok(DeviceMode::Lvm),
            "direct" => Ok(DeviceMode::Direct),
            "fake" => Ok(DeviceMode::Fake),
            _ => Err(Error::Configuration(format!(
                "unsupported device manager type '{}'",
                s
            ))),
        }
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Settings shared by all device manager variants
#[derive(Debug, Clone)]
pub struct DeviceManagerConfig {
    /// Share of each PMEM region reserved for the LVM pool (1..=100)
    pub pmem_percentage: u8,
    /// Capacity of the fake device manager
    pub fake_capacity: u64,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        Self {
            pmem_percentage: 100,
            fake_capacity: 16 * 1024 * 1024 * 1024, // 16GiB
        }
    }
}

/// Create the device manager for `mode`
pub async fn new_device_manager(
    mode: DeviceMode,
    config: &DeviceManagerConfig,
) -> Result<Arc<dyn DeviceManager>> {
    let runner: Arc<dyn CommandRunner> = Arc::new(HostCommandRunner);
    match mode {
        DeviceMode::Lvm => {
            let lvm_config = LvmConfig {
                pmem_percentage: config.pmem_percentage,
                ..Default::default()
            };
            Ok(Arc::new(LvmDeviceManager::new(runner, lvm_config).await?))
        }
        DeviceMode::Direct => Ok(Arc::new(DirectDeviceManager::new(runner))),
        DeviceMode::Fake => Ok(Arc::new(FakeDeviceManager::new(config.fake_capacity))),
    }
}
