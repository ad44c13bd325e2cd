//! Client for an SFU signaling server
//!
//! [`Client::connect`] completes the handshake and starts one dispatcher
//! task. The dispatcher handles server events strictly in arrival order:
//! replies complete the caller waiting on their id, and everything else is
//! routed to the room it names or surfaced as a [`ClientEvent`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use convene_core::{EngineConfig, Handler, Notifier, RoomInfo};

use crate::attachment::{AttachmentUpload, Downloads};
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{Error, Result};
use crate::protocol::{AppIdentity, Operation, OperationFailure, RoomAvailable, ServerEvent, UserData};
use crate::room::{Room, RoomDirectory};
use crate::signaling::Signaling;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    RoomAvailable,
    OperationFailed,
    Unhandled,
    Error,
    Disconnected,
}

/// Event not tied to a joined room
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A room became known without us asking for it
    RoomAvailable(RoomAvailable),
    /// A failure that matched no pending request and no room
    OperationFailed(OperationFailure),
    /// A message this engine has no handling for
    Unhandled { name: String, payload: Value },
    /// Transport or protocol problem; the connection may still be up
    Error(String),
    Disconnected,
}

impl ClientEvent {
    pub fn kind(&self) -> ClientEventKind {
        match self {
            ClientEvent::RoomAvailable(_) => ClientEventKind::RoomAvailable,
            ClientEvent::OperationFailed(_) => ClientEventKind::OperationFailed,
            ClientEvent::Unhandled { .. } => ClientEventKind::Unhandled,
            ClientEvent::Error(_) => ClientEventKind::Error,
            ClientEvent::Disconnected => ClientEventKind::Disconnected,
        }
    }
}

struct Shared {
    signaling: Signaling,
    user: UserData,
    config: Arc<EngineConfig>,
    rooms: Arc<RoomDirectory>,
    notifier: Notifier<ClientEventKind, ClientEvent>,
    downloads: Downloads,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.notifier.notify(&event.kind(), &event) {
            warn!(kind = ?event.kind(), error = %e, "Client event handler failed");
        }
    }

    fn directory(&self) -> std::sync::MutexGuard<'_, HashMap<String, Room>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn room(&self, room_id: &str) -> Option<Room> {
        self.directory().get(room_id).cloned()
    }

    /// Complete pending request `id` with `value`. Returns whether one was
    /// waiting.
    fn reply<T: Serialize>(&self, id: Option<&str>, value: &T) -> bool {
        let Some(id) = id else {
            return false;
        };
        match serde_json::to_value(value) {
            Ok(value) => self.signaling.resolve(id, value),
            Err(e) => self.signaling.reject(id, e.into()),
        }
    }

    fn register_room(&self, available: &RoomAvailable) {
        let mut rooms = self.directory();
        if rooms.contains_key(&available.room_id) {
            return;
        }
        let mut info = RoomInfo::new(
            available.room_id.clone(),
            available.name.clone(),
            self.user.nickname.clone(),
        );
        info.pin = available.pin.clone();
        let created = available
            .creation_time
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        if let Some(created) = created {
            info = info.with_creation_time(created);
        }
        let room = Room::new(
            info,
            self.signaling.clone(),
            self.config.clone(),
            Arc::downgrade(&self.rooms),
        );
        debug!(room_id = %available.room_id, name = %available.name, "Room registered");
        rooms.insert(available.room_id.clone(), room);
    }

    async fn route(&self, event: ServerEvent) {
        let room = event.room_id().and_then(|id| self.room(id));
        match room {
            Some(room) => room.handle_event(event).await,
            None => debug!(event = event.name(), room_id = ?event.room_id(), "Event for unknown room"),
        }
    }

    async fn dispatch(&self, event: ServerEvent) {
        match event {
            ServerEvent::Ack(ack) => {
                if !self.signaling.resolve(&ack.id, Value::Null) {
                    debug!(request_id = %ack.id, "Unsolicited ACK");
                }
            }
            ServerEvent::RoomAvailable(available) => {
                self.register_room(&available);
                let reply = json!({ "roomId": available.room_id });
                if !self.reply(available.id.as_deref(), &reply) {
                    self.emit(ClientEvent::RoomAvailable(available));
                }
            }
            ServerEvent::OperationFailed(failure) => {
                let rejected = failure
                    .id
                    .as_deref()
                    .is_some_and(|id| self.signaling.reject(id, failure.to_error()));
                if rejected {
                    debug!(operation = %failure.operation, error = %failure.error, "Request rejected by server");
                }
                let room = failure.room_id.as_deref().and_then(|id| self.room(id));
                match room {
                    Some(room) => room.handle_failure(failure, rejected).await,
                    None if !rejected => {
                        warn!(operation = %failure.operation, error = %failure.error, "Operation failed");
                        self.emit(ClientEvent::OperationFailed(failure));
                    }
                    None => {}
                }
            }
            ServerEvent::Joined(joined) => {
                if !self.reply(joined.id.as_deref(), &joined) {
                    self.route(ServerEvent::Joined(joined)).await;
                }
            }
            ServerEvent::Left(left) => {
                if !self.reply(left.id.as_deref(), &left) {
                    self.route(ServerEvent::Left(left)).await;
                }
            }
            ServerEvent::Binary(bytes) => self.downloads.handle_frame(&bytes),
            ServerEvent::Unknown { name, payload } => {
                debug!(name = %name, "Unhandled server message");
                self.emit(ClientEvent::Unhandled { name, payload });
            }
            ServerEvent::Ping | ServerEvent::UserData(_) => {
                debug!("Ignoring handshake message after connect");
            }
            other => self.route(other).await,
        }
    }

    fn disconnected(&self) {
        let rejected = self.signaling.pending().reject_all(|| Error::ConnectionClosed);
        self.downloads.fail_all();
        info!(rejected, "Connection closed");
        self.emit(ClientEvent::Disconnected);
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut events: mpsc::Receiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Server(event) => shared.dispatch(event).await,
            ConnectionEvent::Error(e) => {
                warn!(error = %e, "Connection error");
                shared.emit(ClientEvent::Error(e.to_string()));
            }
            ConnectionEvent::Closed => break,
        }
    }
    shared.disconnected();
}

/// Client handle for one signaling session
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Connect over `transport` and wait for the handshake
    pub async fn connect<T: Transport>(transport: T, identity: AppIdentity, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (connection, user, events) = Connection::connect(
            transport,
            &identity,
            config.connect_timeout(),
            config.event_channel_capacity,
        )
        .await?;

        let shared = Arc::new(Shared {
            signaling: Signaling::new(connection, config.request_timeout()),
            user,
            config: Arc::new(config),
            rooms: Arc::new(Mutex::new(HashMap::new())),
            notifier: Notifier::new(),
            downloads: Downloads::default(),
        });
        tokio::spawn(dispatch_loop(shared.clone(), events));

        Ok(Self { shared })
    }

    /// Session data from the handshake
    pub fn user(&self) -> &UserData {
        &self.shared.user
    }

    pub fn is_connected(&self) -> bool {
        !self.connection().is_closed()
    }

    pub fn on<F>(&self, kind: ClientEventKind, handler: F) -> Handler<ClientEvent>
    where
        F: Fn(&ClientEvent) -> convene_core::Result<()> + Send + Sync + 'static,
    {
        let handler: Handler<ClientEvent> = Arc::new(handler);
        self.shared.notifier.add(kind, handler.clone());
        handler
    }

    pub fn off(&self, kind: ClientEventKind, handler: &Handler<ClientEvent>) -> bool {
        self.shared.notifier.remove(&kind, handler)
    }

    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.shared.room(room_id)
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.shared.directory().values().cloned().collect()
    }

    /// Ask the server to create a room. Resolves once it is available.
    pub async fn create_room(&self, name: &str, pin: Option<&str>) -> Result<Room> {
        let mut payload = json!({ "name": name });
        if let Some(pin) = pin {
            payload["pin"] = Value::String(pin.to_string());
        }
        let reply = self.shared.signaling.request(Operation::CreateRoom, payload).await?;
        let room_id = reply
            .get("roomId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("createRoom reply carries no roomId".into()))?;
        info!(room_id, name, "Room created");
        self.room(room_id)
            .ok_or_else(|| Error::Protocol(format!("Room {} vanished before it was returned", room_id)))
    }

    /// Send an arbitrary correlated request and wait for its reply
    pub async fn request(&self, name: &str, payload: Value) -> Result<Value> {
        self.shared.signaling.request_named(name, payload).await
    }

    /// Start uploading `data` on `slot_id`
    pub fn upload_attachment(&self, slot_id: u8, data: &[u8]) -> AttachmentUpload {
        AttachmentUpload::start(
            self.shared.signaling.clone(),
            slot_id,
            data,
            self.shared.config.attachment_chunk_size,
            self.shared.config.chunk_pacing(),
        )
    }

    pub async fn download_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        self.shared
            .downloads
            .fetch(
                &self.shared.signaling,
                message_id,
                attachment_id,
                self.shared.config.request_timeout(),
            )
            .await
    }

    pub fn close(&self) {
        info!("Closing client");
        self.connection().close();
    }

    fn connection(&self) -> &Connection {
        self.shared.signaling.connection()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.connection().close();
    }
}
