//! Volume Controllers
//!
//! - [`MasterController`]: the central, stateless controller. Validates
//!   storage class parameters and routes each volume to the node controllers
//!   found in the registry.
//! - [`NodeController`]: runs on every node, owns the device manager and the
//!   persisted list of node volumes.

pub mod master;
pub mod node;
pub mod state;

pub use master::MasterController;
pub use node::NodeController;
pub use state::FileState;

/// Prefix of generated volume IDs
pub const VOLUME_ID_PREFIX: &str = "pmem-";

/// Derive a stable volume ID from a volume name.
///
/// Repeated CreateVolume calls for the same name must end up on the same
/// device, so the ID is a pure function of the name (64-bit FNV-1a).
pub fn volume_id_for(name: &str) -> String {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = name.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    });
    format!("{}{:016x}", VOLUME_ID_PREFIX, hash)
}
