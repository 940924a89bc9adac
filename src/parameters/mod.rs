//! Volume Parameters
//!
//! Validates, types, defaults and serializes the string maps that describe a
//! volume. The same settings arrive from several call sites (storage class
//! parameters, the master controller, ephemeral inline volumes, the persisted
//! node volume list), and each call site may only use a subset of keys.
//!
//! The key names are persisted outside of the driver (volume contexts in the
//! cluster, the node state directory), so they must never change.

pub mod quantity;
pub mod volume;

pub use quantity::parse_quantity;
pub use volume::{parse, Volume, VolumeContext};

use serde::{Deserialize, Serialize};

// =============================================================================
// Parameter Keys
// =============================================================================

pub const CACHE_SIZE: &str = "cacheSize";
pub const ERASE_AFTER: &str = "eraseafter";
pub const NAME: &str = "name";
pub const PERSISTENCY_MODEL: &str = "persistencyModel";
pub const VOLUME_ID: &str = "_id";
pub const SIZE: &str = "size";

/// Added by Kubernetes to the volume context of inline ephemeral volumes
pub const EPHEMERAL: &str = "csi.storage.k8s.io/ephemeral";

/// Pod info keys added by Kubernetes; any key with this prefix is accepted
/// where the prefix itself is whitelisted
pub const POD_INFO_PREFIX: &str = "csi.storage.k8s.io/";

/// Added by the external provisioner; accepted and discarded
pub const PROVISIONER_ID: &str = "storage.kubernetes.io/csiProvisionerIdentity";

// =============================================================================
// Persistency
// =============================================================================

/// Policy for how the device backing a volume is allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persistency {
    /// A fresh device on exactly one node
    #[default]
    Normal,
    /// Devices with the same name on several nodes
    Cache,
    /// Lives only as long as the pod using it; only used internally
    Ephemeral,
}

impl Persistency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Persistency::Normal => "normal",
            Persistency::Cache => "cache",
            Persistency::Ephemeral => "ephemeral",
        }
    }
}

impl std::fmt::Display for Persistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Origin
// =============================================================================

/// Where a parameter map came from; decides which keys are allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Storage class parameters in the master controller's CreateVolume
    CreateVolume,
    /// Parameters prepared by the master controller for the node CreateVolume
    CreateVolumeInternal,
    /// Inline ephemeral volume parameters in NodePublishVolume
    EphemeralVolume,
    /// Volume context of a persistent volume in NodePublishVolume
    PersistentVolume,
    /// Parameters stored in the node volume list
    NodeVolume,
}

impl Origin {
    pub const ALL: [Origin; 5] = [
        Origin::CreateVolume,
        Origin::CreateVolumeInternal,
        Origin::EphemeralVolume,
        Origin::PersistentVolume,
        Origin::NodeVolume,
    ];

    /// Keys that are valid for this origin. [`POD_INFO_PREFIX`] in the list
    /// admits every key starting with that prefix.
    pub fn valid_keys(&self) -> &'static [&'static str] {
        match self {
            Origin::CreateVolume => &[CACHE_SIZE, ERASE_AFTER, PERSISTENCY_MODEL],
            Origin::CreateVolumeInternal => {
                &[CACHE_SIZE, ERASE_AFTER, PERSISTENCY_MODEL, VOLUME_ID]
            }
            Origin::EphemeralVolume => &[ERASE_AFTER, POD_INFO_PREFIX, SIZE],
            // The CreateVolume parameters are replicated into the volume
            // context together with the name; Kubernetes adds pod info and
            // the provisioner identity.
            Origin::PersistentVolume => &[
                CACHE_SIZE,
                ERASE_AFTER,
                PERSISTENCY_MODEL,
                NAME,
                POD_INFO_PREFIX,
                PROVISIONER_ID,
            ],
            // Everything except the volume ID, which is stored separately.
            Origin::NodeVolume => &[CACHE_SIZE, ERASE_AFTER, NAME, PERSISTENCY_MODEL, SIZE],
        }
    }

    /// Check whether `key` may appear in a map of this origin
    pub fn allows(&self, key: &str) -> bool {
        self.valid_keys().iter().any(|valid| {
            *valid == key || (*valid == POD_INFO_PREFIX && key.starts_with(POD_INFO_PREFIX))
        })
    }
}
