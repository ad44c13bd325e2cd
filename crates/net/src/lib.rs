//! Convene Network Library
//!
//! Async client engine for media rooms hosted by an SFU.
//!
//! # Architecture
//!
//! - **Transport**: ordered text/binary frames; [`TcpTransport`] uses
//!   length-prefixed framing
//! - **Connection**: handshake, keepalive and the background I/O task
//! - **Client**: dispatcher that correlates replies and routes pushes
//! - **Room**: join, renegotiation, tracks and chat over one media session
//!
//! # Usage
//!
//! ```ignore
//! let transport = TcpTransport::connect("127.0.0.1:7331").await?;
//! let identity = AppIdentity::new("app-key").with_credentials("alice", "secret");
//! let client = Client::connect(transport, identity, EngineConfig::load_or_default()?).await?;
//!
//! let room = client.create_room("Standup", Some("1234")).await?;
//! room.on(RoomEventKind::TracksAdded, |event| {
//!     println!("{:?}", event);
//!     Ok(())
//! });
//! let joined = room.join(engine, Vec::new()).await?;
//! ```

pub mod attachment;
pub mod client;
pub mod connection;
pub mod error;
mod frame;
pub mod media;
mod negotiation;
pub mod pool;
pub mod protocol;
pub mod room;
mod signaling;
pub mod transport;

#[cfg(test)]
mod testing;

pub use attachment::{AttachmentUpload, TransferState};
pub use client::{Client, ClientEvent, ClientEventKind};
pub use connection::{Connection, ConnectionEvent};
pub use error::{Error, Result};
pub use media::{
    ControlChannel, DataChannel, MediaConnectionState, MediaEngine, SignalingState, TransceiverHandle,
};
pub use pool::{RemoteTrack, TransceiverPool};
pub use protocol::{AppIdentity, Operation, ServerEvent, SessionDescription, UserData};
pub use room::{JoinReply, Room, RoomEvent, RoomEventKind};
pub use transport::{Frame, TcpTransport, Transport};

pub use convene_core::EngineConfig;

/// Default port for a signaling server reached over [`TcpTransport`]
pub const DEFAULT_PORT: u16 = 7331;
