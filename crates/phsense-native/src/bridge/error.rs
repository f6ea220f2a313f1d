//! Session error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use phsense_core::error::{CalibrationError, ProtocolError};
use phsense_core::types::DeviceId;

use super::platform::PlatformError;

/// Errors that can occur during session management.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Device id not present in the registry
    #[error("Device not found: {0}")]
    UnknownDevice(DeviceId),

    /// Another session is already connecting or connected
    #[error("Session already active for device {0}")]
    SessionActive(DeviceId),

    /// Operation requires a subscribed session for this device
    #[error("Device not connected: {0}")]
    NotConnected(DeviceId),

    /// Operation requires an active device and none is connected
    #[error("No active device")]
    NoActiveDevice,

    /// Transport connect, discovery or subscription failed
    #[error("Connection to {device_id} failed: {reason}")]
    ConnectionFailed {
        /// Device being connected
        device_id: DeviceId,
        /// Failure description
        reason: String,
    },

    /// The peripheral does not expose the pH service triad
    #[error("Characteristic {0} missing from pH service")]
    MissingCharacteristic(Uuid),

    /// A platform call did not complete in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Configured limit
        after: Duration,
    },

    /// The session was torn down while the connect was still in progress
    #[error("Connection to {0} aborted by disconnect")]
    Aborted(DeviceId),

    /// Platform failure outside of the connect path
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Calibration command could not be encoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Calibration input was rejected before encoding
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// The platform event stream was already claimed
    #[error("Platform event stream already taken")]
    EventsUnavailable,

    /// The manager has been shut down
    #[error("Session manager is shut down")]
    ShutDown,
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    /// Whether a fresh attempt may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::Timeout { .. }
                | Self::Aborted(_)
                | Self::Platform(_)
                | Self::NotConnected(_)
                | Self::NoActiveDevice
        )
    }
}
