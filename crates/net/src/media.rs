//! Media engine contract
//!
//! The room drives a local media session it does not implement. Whatever
//! owns the actual peer connection (a WebRTC stack, a test double) plugs in
//! through [`MediaEngine`]. The negotiation code depends on nothing else.

use async_trait::async_trait;
use tokio::sync::mpsc;

use convene_core::{Direction, MediaKind};

use crate::error::Result;
use crate::protocol::SessionDescription;

/// Signaling sub-state of the local session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Transport-level state of the local session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A media line added to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverHandle {
    pub mid: String,
    pub kind: MediaKind,
}

/// Outbound half of the room's control data channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, text: String) -> Result<()>;
}

/// A control data channel: the sender plus the stream of inbound messages
pub struct ControlChannel {
    pub sender: std::sync::Arc<dyn DataChannel>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Commit a local description; a rollback description reverts a pending
    /// local offer
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_transceiver(&self, kind: MediaKind, direction: Direction) -> Result<TransceiverHandle>;

    async fn create_data_channel(&self, label: &str) -> Result<ControlChannel>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> MediaConnectionState;

    async fn close(&self) -> Result<()>;
}
