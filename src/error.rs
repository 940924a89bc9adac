//! Error types for the PMEM-CSI driver
//!
//! Provides one structured error type for parameter validation, device
//! management, the registry, and the transport between controller and nodes.
//! Every variant maps onto an [`ErrorCode`] so that callers (and remote peers)
//! can translate failures into the matching CSI status.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Codes
// =============================================================================

/// Wire-level classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    FailedPrecondition,
    PermissionDenied,
    Unavailable,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

impl ErrorCode {
    /// HTTP status used when this code is returned by the REST API
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::InvalidArgument => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::AlreadyExists => 409,
            ErrorCode::ResourceExhausted => 507,
            ErrorCode::FailedPrecondition => 412,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::Unavailable => 503,
            ErrorCode::DeadlineExceeded => 504,
            ErrorCode::Cancelled => 499,
            ErrorCode::Internal => 500,
        }
    }

    /// Best-effort reverse mapping for responses without an error body
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => ErrorCode::InvalidArgument,
            403 => ErrorCode::PermissionDenied,
            404 => ErrorCode::NotFound,
            409 => ErrorCode::AlreadyExists,
            412 => ErrorCode::FailedPrecondition,
            499 => ErrorCode::Cancelled,
            502 | 503 => ErrorCode::Unavailable,
            504 => ErrorCode::DeadlineExceeded,
            507 => ErrorCode::ResourceExhausted,
            _ => ErrorCode::Internal,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::ResourceExhausted => "resource_exhausted",
            ErrorCode::FailedPrecondition => "failed_precondition",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Internal => "internal",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Error
// =============================================================================

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Parameter Errors
    // =========================================================================
    #[error("parameter {key:?} invalid in this context")]
    ParameterNotAllowed { key: String },

    #[error("parameter {key:?}: {reason}: {value:?}")]
    InvalidParameterValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown parameter: {key:?}")]
    UnknownParameter { key: String },

    #[error("parameter {key:?}: invalid for {other_key:?} = {other_value:?}")]
    ParameterConflict {
        key: String,
        other_key: String,
        other_value: String,
    },

    #[error("required parameter {key:?} not specified")]
    MissingParameter { key: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Device Errors
    // =========================================================================
    #[error("permission denied: {0}")]
    Permission(String),

    #[error("device exists: {name}")]
    DeviceExists { name: String },

    #[error("device not found: {name}")]
    DeviceNotFound { name: String },

    #[error("device in use: {path}")]
    DeviceInUse { path: String },

    #[error("device not ready: {path}: {reason}")]
    DeviceNotReady { path: String, reason: String },

    #[error("not enough space: requested {requested} bytes, available {available} bytes")]
    NotEnoughSpace { requested: u64, available: u64 },

    #[error("command {command} failed: {reason}")]
    Command { command: String, reason: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("no node registered with id: {node_id}")]
    NodeNotFound { node_id: String },

    // =========================================================================
    // Volume Errors
    // =========================================================================
    #[error("volume not found: {volume_id}")]
    VolumeNotFound { volume_id: String },

    #[error("volume {name} already exists with a different size")]
    VolumeExists { name: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("failed to connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote call failed ({code}): {message}")]
    Rpc { code: ErrorCode, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error for callers and remote peers
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ParameterNotAllowed { .. }
            | Error::InvalidParameterValue { .. }
            | Error::UnknownParameter { .. }
            | Error::ParameterConflict { .. }
            | Error::MissingParameter { .. }
            | Error::InvalidArgument(_)
            | Error::Configuration(_) => ErrorCode::InvalidArgument,

            Error::Permission(_) => ErrorCode::PermissionDenied,
            Error::DeviceExists { .. } | Error::VolumeExists { .. } => ErrorCode::AlreadyExists,
            Error::DeviceNotFound { .. }
            | Error::NodeNotFound { .. }
            | Error::VolumeNotFound { .. } => ErrorCode::NotFound,
            Error::DeviceInUse { .. } | Error::DeviceNotReady { .. } => {
                ErrorCode::FailedPrecondition
            }
            Error::NotEnoughSpace { .. } => ErrorCode::ResourceExhausted,

            Error::Connection { .. } => ErrorCode::Unavailable,
            Error::Timeout(_) => ErrorCode::DeadlineExceeded,
            Error::Rpc { code, .. } => *code,
            Error::Http(e) if e.is_timeout() => ErrorCode::DeadlineExceeded,
            Error::Http(e) if e.is_connect() || e.is_request() => ErrorCode::Unavailable,
            Error::Cancelled => ErrorCode::Cancelled,

            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorCode::PermissionDenied
            }
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorCode::NotFound,

            _ => ErrorCode::Internal,
        }
    }

    /// Check if this error is caused by a validation failure
    pub fn is_invalid_argument(&self) -> bool {
        self.code() == ErrorCode::InvalidArgument
    }

    /// Check if this error is transient, i.e. worth retrying unchanged
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Unavailable | ErrorCode::DeadlineExceeded
        ) || matches!(self, Error::Http(_))
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;
