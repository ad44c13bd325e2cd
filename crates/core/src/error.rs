//! Error types for Convene Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Malformed chunk: {0}")]
    Chunk(String),

    #[error("Malformed session description: {0}")]
    Sdp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
