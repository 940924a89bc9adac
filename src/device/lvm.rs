//! LVM Pool Allocator
//!
//! Reserves a configured share of every PMEM region as an fsdax namespace,
//! joins those namespaces into tagged volume groups and carves one logical
//! volume per device out of them. Many small volumes can share a region
//! without per-namespace alignment overhead.

use super::exec::CommandRunner;
use super::ndctl::{self, NAMESPACE_ALIGNMENT, POOL_NAMESPACE_NAME};
use super::util::{clear_device, prepare_device};
use super::{DeviceManager, DeviceMode, PmemDeviceInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the LVM allocator
#[derive(Debug, Clone)]
pub struct LvmConfig {
    /// Share of each region reserved for the pool (1..=100)
    pub pmem_percentage: u8,
    /// Create missing pool namespaces and volume groups on start
    pub setup_pool: bool,
    /// Tag that marks volume groups owned by the driver
    pub tag: String,
}

impl Default for LvmConfig {
    fn default() -> Self {
        Self {
            pmem_percentage: 100,
            setup_pool: true,
            tag: "pmem-csi".to_string(),
        }
    }
}

// =============================================================================
// Volume Groups
// =============================================================================

/// Size information of one volume group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroup {
    pub name: String,
    pub size: u64,
    pub free: u64,
}

fn parse_u64(field: &str, line: &str) -> Result<u64> {
    field.parse().map_err(|_| Error::Command {
        command: "lvm".into(),
        reason: format!("unexpected output line: {:?}", line),
    })
}

/// Parse `vgs --noheadings --nosuffix --units b -o vg_name,vg_size,vg_free`
fn parse_vgs(output: &str) -> Result<Vec<VolumeGroup>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [name, size, free] => Ok(VolumeGroup {
                    name: name.to_string(),
                    size: parse_u64(size, line)?,
                    free: parse_u64(free, line)?,
                }),
                _ => Err(Error::Command {
                    command: "vgs".into(),
                    reason: format!("unexpected output line: {:?}", line),
                }),
            }
        })
        .collect()
}

/// Parse `lvs --noheadings --nosuffix --units b -o lv_name,lv_path,lv_size`
fn parse_lvs(output: &str) -> Result<Vec<PmemDeviceInfo>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [name, path, size] => Ok(PmemDeviceInfo {
                    volume_id: name.to_string(),
                    path: path.to_string(),
                    size: parse_u64(size, line)?,
                }),
                _ => Err(Error::Command {
                    command: "lvs".into(),
                    reason: format!("unexpected output line: {:?}", line),
                }),
            }
        })
        .collect()
}

// =============================================================================
// LVM Device Manager
// =============================================================================

/// Pool allocator based on LVM logical volumes
pub struct LvmDeviceManager {
    runner: Arc<dyn CommandRunner>,
    config: LvmConfig,
    /// Volume groups carrying the pool tag
    volume_groups: RwLock<Vec<String>>,
}

impl LvmDeviceManager {
    /// Create the manager, setting up the pool first if configured
    pub async fn new(runner: Arc<dyn CommandRunner>, config: LvmConfig) -> Result<Self> {
        if !(1..=100).contains(&config.pmem_percentage) {
            return Err(Error::Configuration(format!(
                "invalid PMEM percentage {}",
                config.pmem_percentage
            )));
        }

        let manager = Self {
            runner,
            config,
            volume_groups: RwLock::new(Vec::new()),
        };
        if manager.config.setup_pool {
            manager.setup_pool().await?;
        }
        manager.discover_volume_groups().await?;
        Ok(manager)
    }

    /// Reserve the configured share of every region that has no pool
    /// namespace yet and add it to the region's volume group
    async fn setup_pool(&self) -> Result<()> {
        let regions = ndctl::list_regions(self.runner.as_ref()).await?;
        for region in regions {
            let has_pool = region
                .namespaces
                .iter()
                .any(|ns| ns.name.as_deref() == Some(POOL_NAMESPACE_NAME));
            if has_pool {
                debug!("Region {} already has a pool namespace", region.dev);
                continue;
            }

            let wanted = region.size.saturating_mul(u64::from(self.config.pmem_percentage)) / 100;
            let size = ndctl::align_down(wanted.min(region.available_size), NAMESPACE_ALIGNMENT);
            if size == 0 {
                warn!("Region {} has no space left for the pool", region.dev);
                continue;
            }

            info!(
                "Reserving {} bytes ({}%) of region {} for the pool",
                size, self.config.pmem_percentage, region.dev
            );
            let namespace =
                ndctl::create_namespace(self.runner.as_ref(), &region.dev, size, POOL_NAMESPACE_NAME)
                    .await?;
            let device = namespace.device_path().ok_or_else(|| Error::Command {
                command: "ndctl create-namespace".into(),
                reason: format!("namespace {} has no block device", namespace.dev),
            })?;

            let vg_name = format!("{}-{}", self.config.tag, region.dev);
            let existing = self.query_volume_groups(&[vg_name.as_str()]).await;
            if matches!(existing, Ok(ref groups) if !groups.is_empty()) {
                self.runner.run("vgextend", &[&vg_name, &device]).await?;
            } else {
                self.runner
                    .run("vgcreate", &["--addtag", &self.config.tag, &vg_name, &device])
                    .await?;
            }
        }
        Ok(())
    }

    async fn discover_volume_groups(&self) -> Result<()> {
        let tag = format!("@{}", self.config.tag);
        let groups = self.query_volume_groups(&[tag.as_str()]).await?;
        if groups.is_empty() {
            warn!("No volume groups tagged {} found", self.config.tag);
        }
        info!(
            "LVM device manager using volume groups: {:?}",
            groups.iter().map(|g| &g.name).collect::<Vec<_>>()
        );
        *self.volume_groups.write() = groups.into_iter().map(|g| g.name).collect();
        Ok(())
    }

    async fn query_volume_groups(&self, selection: &[&str]) -> Result<Vec<VolumeGroup>> {
        let mut args = vec![
            "--noheadings",
            "--nosuffix",
            "--units",
            "b",
            "-o",
            "vg_name,vg_size,vg_free",
        ];
        args.extend_from_slice(selection);
        let output = self.runner.run("vgs", &args).await?;
        parse_vgs(&output)
    }

    async fn pool_groups(&self) -> Result<Vec<VolumeGroup>> {
        let names = self.volume_groups.read().clone();
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let selection: Vec<&str> = names.iter().map(String::as_str).collect();
        self.query_volume_groups(&selection).await
    }
}

#[async_trait]
impl DeviceManager for LvmDeviceManager {
    fn mode(&self) -> DeviceMode {
        DeviceMode::Lvm
    }

    async fn get_capacity(&self) -> Result<u64> {
        let groups = self.pool_groups().await?;
        Ok(groups.iter().map(|g| g.free).max().unwrap_or(0))
    }

    async fn create_device(&self, name: &str, size: u64) -> Result<()> {
        if name.is_empty() || size == 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid device name {:?} or size {}",
                name, size
            )));
        }
        if self.list_devices().await?.iter().any(|d| d.volume_id == name) {
            return Err(Error::DeviceExists {
                name: name.to_string(),
            });
        }

        // Best fit: the fullest group that still has room
        let groups = self.pool_groups().await?;
        let target = groups
            .iter()
            .filter(|g| g.free >= size)
            .min_by_key(|g| g.free)
            .ok_or_else(|| Error::NotEnoughSpace {
                requested: size,
                available: groups.iter().map(|g| g.free).max().unwrap_or(0),
            })?;

        info!("Creating logical volume {} ({} bytes) in {}", name, size, target.name);
        let size_arg = format!("{}b", size);
        // Zeroing is done by prepare_device below
        self.runner
            .run("lvcreate", &["-Zn", "-L", &size_arg, "-n", name, &target.name])
            .await?;

        if let Err(e) = self.reclaim_device(name).await {
            // An uncleared volume must not survive for a retry to pick up
            let lv = format!("{}/{}", target.name, name);
            warn!("Removing logical volume {} after failed setup: {}", lv, e);
            if let Err(remove_err) = self.runner.run("lvremove", &["-fy", &lv]).await {
                error!("Failed to remove logical volume {}: {}", lv, remove_err);
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
        self.list_devices()
            .await?
            .into_iter()
            .find(|d| d.volume_id == name)
            .ok_or_else(|| Error::DeviceNotFound {
                name: name.to_string(),
            })
    }

    async fn delete_device(&self, name: &str, flush: bool) -> Result<()> {
        let device = match self.get_device(name).await {
            Ok(device) => device,
            Err(Error::DeviceNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        clear_device(self.runner.as_ref(), &device, flush).await?;
        info!("Removing logical volume {}", device.path);
        self.runner.run("lvremove", &["-fy", &device.path]).await?;
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<PmemDeviceInfo>> {
        let names = self.volume_groups.read().clone();
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec![
            "--noheadings",
            "--nosuffix",
            "--units",
            "b",
            "-o",
            "lv_name,lv_path,lv_size",
        ];
        args.extend(names.iter().map(String::as_str));
        let output = self.runner.run("lvs", &args).await?;
        parse_lvs(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::exec::testing::ScriptedRunner;
    use assert_matches::assert_matches;

    const VGS: &str = "  pmem-csi-region0 68719476736 1073741824\n  pmem-csi-region1 68719476736 4294967296\n";
    const LVS: &str = "  pvc-a /dev/pmem-csi-region0/pvc-a 67645734912\n  pvc-b /dev/pmem-csi-region1/pvc-b 64424509440\n";

    fn config() -> LvmConfig {
        LvmConfig {
            setup_pool: false,
            ..Default::default()
        }
    }

    async fn manager(runner: ScriptedRunner) -> (LvmDeviceManager, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner.on("vgs", VGS).on("lvs", LVS));
        let dm = LvmDeviceManager::new(runner.clone(), config()).await.unwrap();
        (dm, runner)
    }

    #[test]
    fn test_parse_vgs() {
        let groups = parse_vgs(VGS).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].free, 4294967296);
        assert!(parse_vgs("vg0 12\n").is_err());
        assert!(parse_vgs("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_lvs() {
        let devices = parse_lvs(LVS).unwrap();
        assert_eq!(devices[0].volume_id, "pvc-a");
        assert_eq!(devices[0].path, "/dev/pmem-csi-region0/pvc-a");
        assert!(parse_lvs("pvc-a /dev/x big\n").is_err());
    }

    #[tokio::test]
    async fn test_capacity_is_largest_free_group() {
        let (dm, _) = manager(ScriptedRunner::new()).await;
        assert_eq!(dm.get_capacity().await.unwrap(), 4294967296);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_and_oversized() {
        let (dm, runner) = manager(ScriptedRunner::new()).await;

        assert_matches!(
            dm.create_device("pvc-a", 1024).await,
            Err(Error::DeviceExists { .. })
        );
        assert_matches!(
            dm.create_device("pvc-c", 8 * 1024 * 1024 * 1024).await,
            Err(Error::NotEnoughSpace {
                available: 4294967296,
                ..
            })
        );
        assert_matches!(
            dm.create_device("pvc-c", 0).await,
            Err(Error::InvalidArgument(_))
        );
        assert!(!runner.called("lvcreate"));
    }

    #[tokio::test]
    async fn test_create_picks_best_fit_group() {
        // lvcreate succeeds but the new volume never shows up in lvs, so
        // the call fails after the allocation step
        let (dm, runner) =
            manager(ScriptedRunner::new().on("lvcreate", "").on("lvremove", "")).await;

        let err = dm.create_device("pvc-c", 512 * 1024 * 1024).await.unwrap_err();
        assert_matches!(err, Error::DeviceNotFound { .. });
        assert!(runner.called("lvcreate -Zn -L 536870912b -n pvc-c pmem-csi-region0"));
        assert!(runner.called("lvremove -fy pmem-csi-region0/pvc-c"));
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_setup_error() {
        let (dm, runner) = manager(
            ScriptedRunner::new()
                .on("lvcreate", "")
                .fail("lvremove", "logical volume in use"),
        )
        .await;

        let err = dm.create_device("pvc-c", 512 * 1024 * 1024).await.unwrap_err();
        assert_matches!(err, Error::DeviceNotFound { .. });
        assert!(runner.called("lvremove -fy pmem-csi-region0/pvc-c"));
    }

    #[tokio::test]
    async fn test_reclaim_requires_device_node() {
        let (dm, runner) = manager(ScriptedRunner::new()).await;
        // /dev/pmem-csi-region0/pvc-a does not exist on the test host
        let err = dm.reclaim_device("pvc-a").await.unwrap_err();
        assert_matches!(err, Error::DeviceNotReady { .. });
        assert!(!runner.called("shred"));
        assert_matches!(
            dm.reclaim_device("pvc-zzz").await,
            Err(Error::DeviceNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_failed_lvcreate_leaves_nothing_to_remove() {
        let (dm, runner) = manager(
            ScriptedRunner::new().fail("lvcreate", "insufficient free space"),
        )
        .await;

        let err = dm.create_device("pvc-c", 1024 * 1024).await.unwrap_err();
        assert_matches!(err, Error::Command { .. });
        assert!(!runner.called("lvremove"));
    }

    #[tokio::test]
    async fn test_delete_unknown_device_is_noop() {
        let (dm, runner) = manager(ScriptedRunner::new()).await;
        dm.delete_device("pvc-zzz", true).await.unwrap();
        assert!(!runner.called("lvremove"));
        assert!(!runner.called("shred"));
    }

    #[tokio::test]
    async fn test_delete_missing_device_node() {
        let (dm, runner) = manager(ScriptedRunner::new()).await;
        // /dev/pmem-csi-region0/pvc-a does not exist on the test host
        let err = dm.delete_device("pvc-a", false).await.unwrap_err();
        assert_matches!(err, Error::DeviceNotFound { .. });
        assert!(!runner.called("lvremove"));
    }

    #[tokio::test]
    async fn test_setup_pool_reserves_percentage() {
        let regions = r#"[
            {"dev":"region0","size":10737418240,"available_size":10737418240,"type":"pmem"},
            {"dev":"region1","size":10737418240,"available_size":0,"type":"pmem",
             "namespaces":[{"dev":"namespace1.0","name":"pmem-csi-pool","blockdev":"pmem1"}]}
        ]"#;
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("ndctl list", regions)
                .on(
                    "ndctl create-namespace",
                    r#"{"dev":"namespace0.0","mode":"fsdax","blockdev":"pmem0","name":"pmem-csi-pool"}"#,
                )
                .on("vgs --noheadings --nosuffix --units b -o vg_name,vg_size,vg_free pmem-csi-region0", "")
                .on("vgcreate", "")
                .on("vgs --noheadings --nosuffix --units b -o vg_name,vg_size,vg_free @pmem-csi", VGS),
        );
        let config = LvmConfig {
            pmem_percentage: 50,
            ..Default::default()
        };
        LvmDeviceManager::new(runner.clone(), config).await.unwrap();

        assert!(runner.called(
            "ndctl create-namespace --mode fsdax --region region0 --size 5368709120 --name pmem-csi-pool"
        ));
        assert!(runner.called("vgcreate --addtag pmem-csi pmem-csi-region0 /dev/pmem0"));
        let creates = runner
            .calls
            .lock()
            .iter()
            .filter(|c| c.starts_with("ndctl create-namespace"))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_invalid_percentage() {
        let runner = Arc::new(ScriptedRunner::new());
        let config = LvmConfig {
            pmem_percentage: 0,
            ..config()
        };
        assert_matches!(
            LvmDeviceManager::new(runner, config).await.err(),
            Some(Error::Configuration(_))
        );
    }
}
