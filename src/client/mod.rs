//! Outbound Transport
//!
//! Dialing remote endpoints and the typed clients for the registry and the
//! node controllers.

pub mod connection;
pub mod node;
pub mod registry;
pub mod tls;

pub use connection::{Connection, ConnectivityState, DEFAULT_CONNECTION_TIMEOUT};
pub use node::NodeControllerClient;
pub use registry::RegistryClient;
pub use tls::ClientTlsConfig;
