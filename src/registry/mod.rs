//! Registry Service
//!
//! The central directory of node controllers. Node agents register their
//! endpoint here; the master controller looks nodes up to route volume
//! operations. The registry is a single in-memory authority, rebuilt by
//! re-registration after a restart.

pub mod events;
pub mod server;

pub use events::RegistryEvent;
pub use server::{NodeInfo, Registry};
