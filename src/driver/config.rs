//! Driver Configuration
//!
//! Startup settings of the driver and the defaulting rules applied before
//! anything is started.

use crate::client::{ClientTlsConfig, DEFAULT_CONNECTION_TIMEOUT};
use crate::device::DeviceMode;
use crate::error::{Error, Result};
use crate::registration::RegistrationConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which half of the driver this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverMode {
    /// Registry and master controller
    Controller,
    /// Node controller on a PMEM host
    Node,
}

impl std::fmt::Display for DriverMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverMode::Controller => write!(f, "controller"),
            DriverMode::Node => write!(f, "node"),
        }
    }
}

impl std::str::FromStr for DriverMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "controller" => Ok(DriverMode::Controller),
            "node" => Ok(DriverMode::Node),
            _ => Err(Error::Configuration(format!("invalid driver mode: {}", s))),
        }
    }
}

/// Configuration of a driver process
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub node_id: String,
    /// Listen endpoint of this process
    pub endpoint: String,
    pub mode: DriverMode,
    /// Registry endpoint; served in controller mode, dialed in node mode.
    /// Defaults to `endpoint`.
    pub registry_endpoint: Option<String>,
    /// Node controller endpoint; served and advertised in node mode.
    /// Defaults to `endpoint`.
    pub controller_endpoint: Option<String>,
    pub device_mode: DeviceMode,
    /// Node volume state. Defaults to `/var/lib/<driver_name>` in node mode.
    pub state_base_path: Option<PathBuf>,
    /// Share of each PMEM region used by the LVM pool
    pub pmem_percentage: u8,
    /// Capacity of the fake device manager
    pub fake_capacity: u64,
    pub tls: ClientTlsConfig,
    pub connection_timeout: Duration,
    pub registration: RegistrationConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: "pmem-csi.intel.com".to_string(),
            node_id: String::new(),
            endpoint: String::new(),
            mode: DriverMode::Controller,
            registry_endpoint: None,
            controller_endpoint: None,
            device_mode: DeviceMode::default(),
            state_base_path: None,
            pmem_percentage: 100,
            fake_capacity: 16 * 1024 * 1024 * 1024,
            tls: ClientTlsConfig::default(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            registration: RegistrationConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Check mandatory settings and fill in defaults
    pub fn validate(mut self) -> Result<Self> {
        if self.driver_name.is_empty() || self.node_id.is_empty() || self.endpoint.is_empty() {
            return Err(Error::Configuration(
                "one of the mandatory options (driver name, node ID, endpoint) is missing".into(),
            ));
        }
        if !(1..=100).contains(&self.pmem_percentage) {
            return Err(Error::Configuration(format!(
                "PMEM percentage must be between 1 and 100, got {}",
                self.pmem_percentage
            )));
        }

        if self.registry_endpoint.as_deref().map_or(true, str::is_empty) {
            self.registry_endpoint = Some(self.endpoint.clone());
        }
        if self.controller_endpoint.as_deref().map_or(true, str::is_empty) {
            self.controller_endpoint = Some(self.endpoint.clone());
        }
        if self.mode == DriverMode::Node && self.state_base_path.is_none() {
            self.state_base_path = Some(PathBuf::from(format!("/var/lib/{}", self.driver_name)));
        }
        Ok(self)
    }

    /// Registry endpoint after defaulting
    pub fn registry_endpoint(&self) -> &str {
        self.registry_endpoint.as_deref().unwrap_or(&self.endpoint)
    }

    /// Node controller endpoint after defaulting
    pub fn controller_endpoint(&self) -> &str {
        self.controller_endpoint.as_deref().unwrap_or(&self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn node_config() -> DriverConfig {
        DriverConfig {
            node_id: "node-1".into(),
            endpoint: "tcp://0.0.0.0:10001".into(),
            mode: DriverMode::Node,
            ..Default::default()
        }
    }

    #[test]
    fn test_mandatory_options() {
        for config in [
            DriverConfig {
                node_id: String::new(),
                ..node_config()
            },
            DriverConfig {
                endpoint: String::new(),
                ..node_config()
            },
            DriverConfig {
                driver_name: String::new(),
                ..node_config()
            },
        ] {
            assert_matches!(config.validate(), Err(Error::Configuration(_)));
        }
    }

    #[test]
    fn test_defaults() {
        let config = node_config().validate().unwrap();
        assert_eq!(config.registry_endpoint(), "tcp://0.0.0.0:10001");
        assert_eq!(config.controller_endpoint(), "tcp://0.0.0.0:10001");
        assert_eq!(
            config.state_base_path,
            Some(PathBuf::from("/var/lib/pmem-csi.intel.com"))
        );

        let config = DriverConfig {
            mode: DriverMode::Controller,
            registry_endpoint: Some("tcp://0.0.0.0:10000".into()),
            ..node_config()
        }
        .validate()
        .unwrap();
        assert_eq!(config.registry_endpoint(), "tcp://0.0.0.0:10000");
        assert!(config.state_base_path.is_none());
    }

    #[test]
    fn test_pmem_percentage_range() {
        for pct in [0, 101] {
            let config = DriverConfig {
                pmem_percentage: pct,
                ..node_config()
            };
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_driver_mode_parse() {
        assert_eq!("node".parse::<DriverMode>().unwrap(), DriverMode::Node);
        assert_eq!(
            "controller".parse::<DriverMode>().unwrap(),
            DriverMode::Controller
        );
        assert!("webhooks".parse::<DriverMode>().is_err());
    }
}
