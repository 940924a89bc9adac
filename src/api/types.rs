//! Wire Types
//!
//! Request and response bodies shared by the REST handlers and the clients.

use crate::error::{Error, ErrorCode};
use crate::parameters::VolumeContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Error body returned with every non-success status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ErrorCode,
    pub message: String,
}

impl From<&Error> for ApiErrorResponse {
    fn from(err: &Error) -> Self {
        Self {
            error: err.code(),
            message: err.to_string(),
        }
    }
}

/// Reply of calls without a result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterControllerRequest {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub endpoint: String,
}

// =============================================================================
// Volumes
// =============================================================================

/// CreateVolume as sent to the master controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    /// Requested size in bytes, the only source of the volume size
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Candidate nodes in order of preference, supplied by the scheduler
    #[serde(default)]
    pub preferred_nodes: Vec<String>,
}

/// CreateVolume as forwarded to a node controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// A provisioned volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    pub volume_id: String,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_context: VolumeContext,
    /// Nodes holding the volume
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVolumesResponse {
    pub volumes: Vec<VolumeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityResponse {
    pub available_capacity: u64,
}

/// Liveness check reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}
