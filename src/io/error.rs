// src/io/error.rs
//
// Error taxonomy for the CAN Bus Triple link.
//
// Every failure surfaced by the encoder, the settings codec, the link and the
// controller is an `IoError`. The variant tells the caller what it may do next:
// validation errors are never retried, busy means wait or cancel, timeouts may
// be resubmitted, device errors are the device saying no.

use thiserror::Error;

/// Errors raised by the command encoder, settings codec, link and controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    /// Bad parameters, detected before any byte is written.
    #[error("Invalid parameter: {0}")]
    Validation(String),

    /// Another correlated command is already in flight.
    #[error("{device}: busy, cannot {operation}")]
    Busy { device: String, operation: String },

    /// No matching response arrived before the deadline.
    #[error("{device}: timed out waiting for {operation}")]
    Timeout { device: String, operation: String },

    /// Malformed frame content received from the device.
    #[error("{device}: protocol error: {message}")]
    Protocol { device: String, message: String },

    /// The device rejected a command or answered with the wrong content.
    #[error("{device}: device error: {message}")]
    Device { device: String, message: String },

    /// Settings image with the wrong size or unusable content.
    #[error("Invalid settings image: {0}")]
    Format(String),

    /// The byte channel could not be opened.
    #[error("{device}: connection failed: {message}")]
    Connection { device: String, message: String },

    /// The byte channel failed while reading.
    #[error("{device}: read failed: {message}")]
    Read { device: String, message: String },

    /// The byte channel failed while writing.
    #[error("{device}: write failed: {message}")]
    Write { device: String, message: String },

    /// The pending command was cancelled before a response arrived.
    #[error("{device}: {operation} cancelled")]
    Cancelled { device: String, operation: String },

    /// The operation needs an open link.
    #[error("{device}: link is not open")]
    NotOpen { device: String },

    /// Configuration could not be loaded or saved.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl IoError {
    pub fn validation(message: impl Into<String>) -> Self {
        IoError::Validation(message.into())
    }

    pub fn busy(device: &str, operation: impl Into<String>) -> Self {
        IoError::Busy {
            device: device.to_string(),
            operation: operation.into(),
        }
    }

    pub fn timeout(device: &str, operation: impl Into<String>) -> Self {
        IoError::Timeout {
            device: device.to_string(),
            operation: operation.into(),
        }
    }

    pub fn protocol(device: &str, message: impl Into<String>) -> Self {
        IoError::Protocol {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn device(device: &str, message: impl Into<String>) -> Self {
        IoError::Device {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        IoError::Format(message.into())
    }

    pub fn connection(device: &str, message: impl Into<String>) -> Self {
        IoError::Connection {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn read(device: &str, message: impl Into<String>) -> Self {
        IoError::Read {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn write(device: &str, message: impl Into<String>) -> Self {
        IoError::Write {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn cancelled(device: &str, operation: impl Into<String>) -> Self {
        IoError::Cancelled {
            device: device.to_string(),
            operation: operation.into(),
        }
    }

    pub fn not_open(device: &str) -> Self {
        IoError::NotOpen {
            device: device.to_string(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        IoError::Configuration(message.into())
    }

    /// True for errors raised before any I/O took place.
    pub fn is_validation(&self) -> bool {
        matches!(self, IoError::Validation(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, IoError::Busy { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, IoError::Timeout { .. })
    }
}

impl From<IoError> for String {
    fn from(e: IoError) -> Self {
        e.to_string()
    }
}
