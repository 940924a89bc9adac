//! ndctl Bindings
//!
//! Region and namespace enumeration through the `ndctl` JSON output.

use super::exec::CommandRunner;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Namespace alignment used for every namespace we create
pub const NAMESPACE_ALIGNMENT: u64 = 2 * 1024 * 1024; // 2MiB

/// Name of the namespaces that back the LVM pool
pub const POOL_NAMESPACE_NAME: &str = "pmem-csi-pool";

/// A PMEM region as reported by `ndctl list --regions --namespaces`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub dev: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub available_size: u64,
    #[serde(rename = "type", default)]
    pub region_type: String,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
}

impl Region {
    pub fn is_pmem(&self) -> bool {
        self.region_type == "pmem"
    }
}

/// A namespace as reported by ndctl
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub dev: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub blockdev: Option<String>,
}

impl Namespace {
    /// Device node of the namespace, if it has one
    pub fn device_path(&self) -> Option<String> {
        self.blockdev.as_ref().map(|b| format!("/dev/{}", b))
    }
}

/// ndctl prints a bare object instead of an array when there is exactly one
/// entry, and nothing at all when there are none
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

fn parse_list<T: for<'de> Deserialize<'de>>(output: &str) -> Result<Vec<T>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(match serde_json::from_str::<OneOrMany<T>>(output)? {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    })
}

/// Round `size` down to a multiple of `align`
pub fn align_down(size: u64, align: u64) -> u64 {
    size / align * align
}

/// Round `size` up to a multiple of `align`
pub fn align_up(size: u64, align: u64) -> Option<u64> {
    size.checked_add(align - 1).map(|s| align_down(s, align))
}

/// All PMEM regions with their namespaces
pub async fn list_regions(runner: &dyn CommandRunner) -> Result<Vec<Region>> {
    let output = runner
        .run("ndctl", &["list", "--regions", "--namespaces"])
        .await?;
    let regions: Vec<Region> = parse_list(&output)?;
    Ok(regions.into_iter().filter(Region::is_pmem).collect())
}

/// Create an fsdax namespace in `region`
pub async fn create_namespace(
    runner: &dyn CommandRunner,
    region: &str,
    size: u64,
    name: &str,
) -> Result<Namespace> {
    let size = size.to_string();
    let output = runner
        .run(
            "ndctl",
            &[
                "create-namespace",
                "--mode",
                "fsdax",
                "--region",
                region,
                "--size",
                &size,
                "--name",
                name,
            ],
        )
        .await?;
    serde_json::from_str(&output).map_err(|e| Error::Command {
        command: "ndctl create-namespace".into(),
        reason: format!("unexpected output: {}", e),
    })
}

/// Destroy a namespace, e.g. `namespace0.1`
pub async fn destroy_namespace(runner: &dyn CommandRunner, dev: &str) -> Result<()> {
    runner
        .run("ndctl", &["destroy-namespace", "--force", dev])
        .await?;
    Ok(())
}
