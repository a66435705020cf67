//! Error types for mesh relay operations

use crate::message::MessageId;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur in the mesh relay layer
///
/// Only [`MeshError::is_terminal`] errors ever reach an observer's
/// `on_failure`. Everything else is absorbed where it happens: dropped,
/// queued or retried.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Link unavailable: {0}")]
    LinkUnavailable(String),

    #[error("No connected devices")]
    NoConnectedDevices,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Radio capability unavailable: {0}")]
    RadioCapabilityUnavailable(String),

    #[error("Duplicate message: {0}")]
    DuplicateMessage(MessageId),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Radio error: {0}")]
    Radio(String),

    /// The radio cannot perform this role on the current platform
    #[error("Unsupported by this radio: {0}")]
    Unsupported(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl MeshError {
    /// Whether this error ends the mesh layer's ability to operate
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MeshError::RadioCapabilityUnavailable(_) | MeshError::InvariantViolation(_)
        )
    }

    /// Whether retrying the same radio operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeshError::LinkUnavailable(_) | MeshError::ConnectionFailed(_) | MeshError::Radio(_)
        )
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

impl From<btleplug::Error> for MeshError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => {
                MeshError::RadioCapabilityUnavailable("Bluetooth permission denied".to_string())
            }
            btleplug::Error::DeviceNotFound | btleplug::Error::NotConnected => {
                MeshError::LinkUnavailable(err.to_string())
            }
            btleplug::Error::NotSupported(reason) => MeshError::RadioCapabilityUnavailable(reason),
            other => MeshError::Radio(other.to_string()),
        }
    }
}
