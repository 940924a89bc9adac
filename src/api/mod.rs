//! API Module
//!
//! Inbound transport: the REST router and server carrying the registry,
//! master controller and node controller calls, plus the wire types shared
//! with the clients.

pub mod rest;
pub mod server;
pub mod types;

pub use rest::{error_response, router, ApiState};
pub use server::{listen_addr, ApiServer};
