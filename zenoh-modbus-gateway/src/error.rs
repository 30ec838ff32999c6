//! Gateway error type.

use thiserror::Error;

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors produced while routing, validating and executing register operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Topic does not follow the `channels[.<id>].modbus.<verb>...` grammar.
    #[error("Malformed topic: {0}")]
    MalformedTopic(String),

    /// Payload or configuration blob could not be decoded or is out of range.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Protocol token other than `tcp` or `rtu`.
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Write requested on a read-only data point.
    #[error("Data point '{0}' does not support writes")]
    UnsupportedWriteDataPoint(String),

    /// Write value missing, of the wrong JSON shape, or inconsistent with the quantity.
    #[error("Invalid value: {0}")]
    InvalidValueShape(String),

    /// Device could not be reached or the serial port could not be opened.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Device answered with a Modbus exception.
    #[error("Modbus exception: {0}")]
    ProtocolException(String),

    /// I/O failure or timeout during an operation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Stop requested for an address without an active poll.
    #[error("No active poll for register {0}")]
    RegisterNotFound(u16),

    /// Session id unknown or already closed.
    #[error("Session {0} is not configured")]
    DeviceNotConfigured(u32),

    /// Bus publish failed.
    #[error("Publish failed: {0}")]
    Publish(String),
}

impl GatewayError {
    /// Errors caused by the request itself rather than the device or the bus.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MalformedTopic(_)
                | Self::MalformedPayload(_)
                | Self::UnsupportedProtocol(_)
                | Self::UnsupportedWriteDataPoint(_)
                | Self::InvalidValueShape(_)
        )
    }

    /// Errors that name something that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RegisterNotFound(_) | Self::DeviceNotConfigured(_))
    }
}
