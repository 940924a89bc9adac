//! PMEM-CSI - Persistent Memory Volume Orchestration
//!
//! The volume orchestration core of a CSI driver that turns node-local
//! persistent memory into Kubernetes volumes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                         Controller (one per cluster)                         │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────┐        ┌─────────────────────────────────┐  │
//! │  │      Master Controller      │───────▶│            Registry             │  │
//! │  │  (parameters, routing)      │ lookup │   node ID -> endpoint (mutex)   │  │
//! │  └──────────────┬──────────────┘        └────────────────▲────────────────┘  │
//! └─────────────────┼────────────────────────────────────────┼──────────────────┘
//!                   │ CreateVolume / DeleteVolume            │ Register /
//!                   ▼                                        │ Unregister
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           Node (one per PMEM host)                           │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────┐        ┌─────────────────────────────────┐  │
//! │  │       Node Controller       │        │         Node Registrar          │  │
//! │  │  (per-volume locks, state)  │        │  (retry forever + watcher)      │  │
//! │  └──────────────┬──────────────┘        └─────────────────────────────────┘  │
//! │                 ▼                                                            │
//! │  ┌─────────────────────────────────────────────────────────────────────────┐ │
//! │  │                            Device Manager                               │ │
//! │  │   LVM (pool of namespaces)  │  Direct (namespace per volume)  │  Fake   │ │
//! │  └─────────────────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`parameters`]: Volume parameter validation and volume context encoding
//! - [`device`]: Device managers over ndctl and LVM
//! - [`registry`]: Node controller registry and its events
//! - [`registration`]: Node side of the registration protocol
//! - [`controller`]: Master and node volume controllers
//! - [`api`]: REST server and wire types
//! - [`client`]: REST clients for the registry and node controllers
//! - [`driver`]: Process configuration and run loop
//! - [`error`]: Error types and handling

pub mod api;
pub mod client;
pub mod controller;
pub mod device;
pub mod driver;
pub mod error;
pub mod parameters;
pub mod registration;
pub mod registry;

// Re-export commonly used types
pub use api::{ApiServer, ApiState};

pub use client::{ClientTlsConfig, Connection, NodeControllerClient, RegistryClient};

pub use controller::{volume_id_for, FileState, MasterController, NodeController};

pub use device::{
    new_device_manager, DeviceManager, DeviceManagerConfig, DeviceMode, PmemDeviceInfo,
};

pub use driver::{DriverConfig, DriverMode, PmemDriver};

pub use error::{Error, ErrorCode, Result};

pub use parameters::{Origin, Persistency, Volume, VolumeContext};

pub use registration::{NodeRegistrar, RegistrationConfig, RegistrationState};

pub use registry::{NodeInfo, Registry, RegistryEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
