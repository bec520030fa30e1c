use thiserror::Error;
use uuid::Uuid;

use crate::protocol::att_error_description;

/// Errors that can occur while talking to a Dats peripheral
#[derive(Error, Debug)]
pub enum DatsError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No local adapter matched the requested interface
    #[error("Bluetooth adapter not found: {0}")]
    AdapterNotFound(String),

    /// Peripheral not found during scanning
    #[error("Device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Invalid command line or configuration parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The peer answered a request with an ATT error response
    #[error("{}", att_error_description(*code))]
    Att {
        /// ATT error code
        code: u8,
    },

    /// Protocol error
    #[error("{0}")]
    Protocol(String),

    /// Target primary service is not present on the peripheral
    #[error("Service {0} not found on this device")]
    ServiceNotFound(Uuid),

    /// Target characteristic is not present within the service range
    #[error("Did not find the {0} value UUID")]
    CharacteristicNotFound(Uuid),

    /// More primary services were discovered than the table holds
    #[error("Exceeded maximum primary amount of {capacity} (found {found})")]
    ServiceTableFull {
        /// Table capacity
        capacity: usize,
        /// Number of services reported by the peer
        found: usize,
    },

    /// Notification payload has the wrong size
    #[error("Not enough data, got {len}, expected 12")]
    PayloadLength {
        /// Received payload length
        len: usize,
    },

    /// Operation not allowed in the current session state
    #[error("Invalid session state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Output serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for Dats operations
pub type Result<T> = std::result::Result<T, DatsError>;

impl DatsError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::AdapterNotFound(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
        )
    }

    /// Check if this error ends the session
    ///
    /// Only malformed payloads are skipped; everything else tears the
    /// session down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::PayloadLength { .. })
    }

    /// Process exit status for this error
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_fatal() {
            1
        } else {
            0
        }
    }

    /// Wrap an error with the name of the operation that produced it
    #[must_use]
    pub fn context(self, operation: &str) -> Self {
        match self {
            Self::Att { .. } | Self::Protocol(_) => {
                Self::Protocol(format!("{operation} failed: {self}"))
            }
            other => other,
        }
    }
}
