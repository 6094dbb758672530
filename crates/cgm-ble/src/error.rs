//! Error types for the BLE layers
//!
//! Errors are split by the layer that produces them:
//!
//! - [`TransportError`] comes from the platform BLE stack
//! - [`SessionError`] comes from a [`PeripheralSession`](crate::session::PeripheralSession) command
//! - [`SensorError`] is what the sensor protocol reports to its delegate

use thiserror::Error;
use uuid::Uuid;

/// Errors reported by the platform BLE transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peripheral closed the link; this is the normal way a sensor hangs up
    #[error("Peripheral disconnected")]
    PeripheralDisconnected,

    /// Connection attempt failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Request issued against a peripheral that is not connected
    #[error("Peripheral not connected")]
    NotConnected,

    /// Adapter is powered off or unavailable
    #[error("Bluetooth adapter powered off")]
    PoweredOff,

    /// Peripheral or characteristic is unknown to the transport
    #[error("Unknown peripheral or attribute: {0}")]
    Unknown(String),

    /// Session was torn down while a request was pending
    #[error("Session closed")]
    SessionClosed,

    /// Any other platform error
    #[error("Platform error: {0}")]
    Platform(String),
}

impl TransportError {
    /// True for the remote-initiated disconnect that sensors use routinely
    pub fn is_remote_disconnect(&self) -> bool {
        matches!(self, TransportError::PeripheralDisconnected)
    }

    /// Check if the request may succeed when issued again
    pub fn is_retriable(&self) -> bool {
        !matches!(self, TransportError::Unknown(_))
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::PeripheralDisconnected => "PERIPHERAL_DISCONNECTED",
            TransportError::ConnectionFailed(_) => "CONNECTION_FAILED",
            TransportError::NotConnected => "NOT_CONNECTED",
            TransportError::PoweredOff => "POWERED_OFF",
            TransportError::Unknown(_) => "UNKNOWN_ATTRIBUTE",
            TransportError::SessionClosed => "SESSION_CLOSED",
            TransportError::Platform(_) => "PLATFORM_ERROR",
        }
    }
}

/// Errors returned by peripheral session commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Adapter is not powered on or the peripheral is not connected
    #[error("Peripheral session not ready")]
    NotReady,

    /// A command was issued while another one is still pending
    #[error("Invalid configuration: a command is already pending")]
    InvalidConfiguration,

    /// Expected callbacks did not arrive in time
    #[error("Command timed out after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Characteristic or service not present after discovery
    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(Uuid),

    /// Error reported by the transport while the command ran
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Check if the command may succeed when issued again
    pub fn is_retriable(&self) -> bool {
        match self {
            SessionError::NotReady | SessionError::Timeout { .. } => true,
            SessionError::Transport(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::NotReady => "NOT_READY",
            SessionError::InvalidConfiguration => "INVALID_CONFIGURATION",
            SessionError::Timeout { .. } => "TIMEOUT",
            SessionError::UnknownCharacteristic(_) => "UNKNOWN_CHARACTERISTIC",
            SessionError::Transport(e) => e.error_code(),
        }
    }
}

/// Errors reported by the sensor protocol
#[derive(Error, Debug, Clone)]
pub enum SensorError {
    /// Enabling notifications on a characteristic failed
    #[error("Error enabling notification for {characteristic}: {source}")]
    Control {
        /// Characteristic name
        characteristic: String,
        /// Underlying session error
        #[source]
        source: SessionError,
    },

    /// A frame could not be decoded
    #[error("Observation error: {0}")]
    Observation(String),

    /// Session command failed
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Transport failed while connecting or configuring
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Background task is gone
    #[error("Channel closed")]
    ChannelClosed,
}

impl SensorError {
    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            SensorError::Control { .. } => "CONTROL_ERROR",
            SensorError::Observation(_) => "OBSERVATION_ERROR",
            SensorError::Session(e) => e.error_code(),
            SensorError::Transport(e) => e.error_code(),
            SensorError::InvalidConfig(_) => "INVALID_CONFIG",
            SensorError::ChannelClosed => "CHANNEL_CLOSED",
        }
    }
}

/// Result type alias for sensor operations
pub type Result<T> = std::result::Result<T, SensorError>;
