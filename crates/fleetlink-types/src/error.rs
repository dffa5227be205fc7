//! Shared error types for FleetLink.

use crate::capability::Capability;
use thiserror::Error;

/// Top-level error type shared by the wire runtime, the gate and the hub.
#[derive(Error, Debug)]
pub enum FleetError {
    /// A frame could not be decoded into a U-WBP message.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Transport-level failure (connect, send, handshake).
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection was closed while the operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The adapter backing this peer cannot perform the operation.
    #[error("Capability not supported: {0}")]
    CapabilityDenied(Capability),

    /// Command text the console cannot take as one line.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A command exceeded its timeout.
    #[error("Command '{command}' timed out after {timeout_ms}ms")]
    CommandTimeout {
        /// The command text.
        command: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The security gate rejected a request.
    #[error("Request denied: {0}")]
    SecurityDenied(String),

    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}

/// Alias for Result with FleetError.
pub type FleetResult<T> = Result<T, FleetError>;
