//! Registry Events
//!
//! Emitted when node controllers come and go so that consumers such as the
//! master controller or a scheduler extension can react.

use serde::{Deserialize, Serialize};

/// Events emitted by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A node controller registered or re-registered
    ControllerRegistered { node_id: String, endpoint: String },

    /// A node controller unregistered
    ControllerUnregistered { node_id: String },
}

impl RegistryEvent {
    /// Get the node ID associated with this event
    pub fn node_id(&self) -> &str {
        match self {
            RegistryEvent::ControllerRegistered { node_id, .. } => node_id,
            RegistryEvent::ControllerUnregistered { node_id } => node_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_node_id() {
        let event = RegistryEvent::ControllerRegistered {
            node_id: "pmem-node-1".to_string(),
            endpoint: "tcp://10.0.0.1:10001".to_string(),
        };
        assert_eq!(event.node_id(), "pmem-node-1");

        let event = RegistryEvent::ControllerUnregistered {
            node_id: "pmem-node-2".to_string(),
        };
        assert_eq!(event.node_id(), "pmem-node-2");
    }
}
