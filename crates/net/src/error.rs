//! Network and engine error types

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// tid or signaling sub-state mismatch; superseded by a newer exchange
    #[error("Stale negotiation: {0}")]
    StaleNegotiation(String),

    #[error("Operation {operation} failed: {error}")]
    OperationFailed { operation: String, error: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Already disposed")]
    AlreadyDisposed,

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Media engine error: {0}")]
    Media(String),

    #[error(transparent)]
    Core(convene_core::Error),
}

impl From<convene_core::Error> for Error {
    fn from(e: convene_core::Error) -> Self {
        match e {
            convene_core::Error::ProtocolViolation(msg) => Error::ProtocolViolation(msg),
            other => Error::Core(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(format!("Invalid JSON: {}", e))
    }
}
