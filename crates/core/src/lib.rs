//! Convene Core Library
//!
//! Runtime-agnostic building blocks for the SFU room client: models, the
//! request correlation registry, the event notifier, chunk codecs, the SDP
//! line rewriting used during negotiation, and engine configuration.

pub mod chunk;
pub mod config;
pub mod error;
pub mod invariants;
pub mod models;
pub mod notifier;
pub mod registry;
pub mod sdp;

pub use chunk::{AttachmentChunk, AttachmentCommand, ChatChunk, Reassembler};
pub use config::{EngineConfig, PoolConfig};
pub use error::{Error, Result};
pub use models::*;
pub use notifier::{Handler, Notifier};
pub use registry::PendingRequests;

/// Mint a transaction id for one offer/answer exchange
pub fn mint_tid() -> String {
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
