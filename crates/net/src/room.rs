//! Room handle
//!
//! A [`Room`] owns one media session with the SFU: it joins with an offer,
//! keeps the session renegotiated as tracks come and go, carries chat over
//! the control data channel, and turns server pushes into [`RoomEvent`]s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use convene_core::chunk::split_text;
use convene_core::invariants::{assert_room_invariants, is_valid_transition};
use convene_core::{
    ChatChunk, ChatMessage, EngineConfig, Handler, MediaKind, Notifier, ParticipantTracks, Reassembler, RoomInfo,
    RoomRole, RoomState, TrackLabel,
};

use crate::error::{Error, Result};
use crate::media::{DataChannel, MediaEngine};
use crate::negotiation::Negotiator;
use crate::pool::{RemoteTrack, TransceiverPool};
use crate::protocol::{
    Operation, OperationFailure, ParticipantJoined, ParticipantLeft, ServerEvent, WaitingRoomUpdate,
};
use crate::signaling::Signaling;

/// Label of the control data channel opened at join
pub const CHAT_CHANNEL: &str = "chat";

/// Rooms known to a client, by id
pub(crate) type RoomDirectory = Mutex<HashMap<String, Room>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomEventKind {
    StateChanged,
    RoleAssigned,
    ParticipantJoined,
    ParticipantLeft,
    TracksAdded,
    TracksRemoved,
    WaitingRoom,
    Message,
    OperationFailed,
    Ended,
    Evicted,
    Left,
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    StateChanged(RoomState),
    RoleAssigned(RoomRole),
    ParticipantJoined(ParticipantJoined),
    ParticipantLeft(ParticipantLeft),
    TracksAdded(ParticipantTracks),
    TracksRemoved(ParticipantTracks),
    WaitingRoom(WaitingRoomUpdate),
    /// A complete chat message from the data channel
    Message(ChatMessage),
    /// A server failure nobody was waiting for
    OperationFailed(OperationFailure),
    /// The room was destroyed
    Ended,
    /// A moderator removed us
    Evicted,
    /// Our membership was cancelled
    Left,
}

impl RoomEvent {
    pub fn kind(&self) -> RoomEventKind {
        match self {
            RoomEvent::StateChanged(_) => RoomEventKind::StateChanged,
            RoomEvent::RoleAssigned(_) => RoomEventKind::RoleAssigned,
            RoomEvent::ParticipantJoined(_) => RoomEventKind::ParticipantJoined,
            RoomEvent::ParticipantLeft(_) => RoomEventKind::ParticipantLeft,
            RoomEvent::TracksAdded(_) => RoomEventKind::TracksAdded,
            RoomEvent::TracksRemoved(_) => RoomEventKind::TracksRemoved,
            RoomEvent::WaitingRoom(_) => RoomEventKind::WaitingRoom,
            RoomEvent::Message(_) => RoomEventKind::Message,
            RoomEvent::OperationFailed(_) => RoomEventKind::OperationFailed,
            RoomEvent::Ended => RoomEventKind::Ended,
            RoomEvent::Evicted => RoomEventKind::Evicted,
            RoomEvent::Left => RoomEventKind::Left,
        }
    }
}

/// What the server confirmed when our join completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinReply {
    pub name: String,
    pub chat_id: Option<String>,
    pub user_id: Option<String>,
}

/// Local reaction to a failure string the server uses for room teardown
fn failure_reaction(error: &str) -> Option<RoomEvent> {
    let error = error.to_ascii_lowercase();
    if error.contains("destroyed") {
        Some(RoomEvent::Ended)
    } else if error.contains("authorization failed") {
        Some(RoomEvent::Evicted)
    } else if error.contains("cancelled") {
        Some(RoomEvent::Left)
    } else {
        None
    }
}

/// Media session state that exists from join until disposal
struct Session {
    engine: Arc<dyn MediaEngine>,
    negotiator: Negotiator,
    pool: Arc<TransceiverPool>,
    chat: Arc<dyn DataChannel>,
    chat_reader: JoinHandle<()>,
}

impl Session {
    async fn shutdown(&self) {
        self.chat_reader.abort();
        self.pool.clear();
        if let Err(e) = self.engine.close().await {
            warn!(error = %e, "Media engine close failed");
        }
    }
}

struct RoomInner {
    room_id: String,
    info: RwLock<RoomInfo>,
    chat_id: RwLock<Option<String>>,
    signaling: Signaling,
    config: Arc<EngineConfig>,
    session: RwLock<Option<Arc<Session>>>,
    notifier: Notifier<RoomEventKind, RoomEvent>,
    inbound_chat: Mutex<Reassembler<String>>,
    directory: Weak<RoomDirectory>,
}

impl RoomInner {
    fn emit(&self, event: RoomEvent) {
        if let Err(e) = self.notifier.notify(&event.kind(), &event) {
            warn!(room_id = %self.room_id, kind = ?event.kind(), error = %e, "Room event handler failed");
        }
    }

    fn inbound_chat(&self) -> MutexGuard<'_, Reassembler<String>> {
        self.inbound_chat.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn receive_chat(&self, text: &str) {
        let chunk = match ChatChunk::from_json(text) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "Dropping malformed chat chunk");
                return;
            }
        };
        let complete = self
            .inbound_chat()
            .push(chunk.id, chunk.payload.into_bytes(), chunk.last);
        let Some(bytes) = complete else {
            return;
        };
        match serde_json::from_slice::<ChatMessage>(&bytes) {
            Ok(message) => self.emit(RoomEvent::Message(message)),
            Err(e) => warn!(room_id = %self.room_id, error = %e, "Dropping undecodable chat message"),
        }
    }
}

async fn chat_reader(room: Weak<RoomInner>, mut incoming: tokio::sync::mpsc::UnboundedReceiver<String>) {
    while let Some(text) = incoming.recv().await {
        let Some(inner) = room.upgrade() else {
            break;
        };
        inner.receive_chat(&text);
    }
}

/// Handle to one room; clones share state
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("room_id", &self.inner.room_id).finish()
    }
}

impl Room {
    pub(crate) fn new(
        info: RoomInfo,
        signaling: Signaling,
        config: Arc<EngineConfig>,
        directory: Weak<RoomDirectory>,
    ) -> Self {
        let inbound_chat = Reassembler::with_limit(config.max_pending_chat_groups);
        Self {
            inner: Arc::new(RoomInner {
                room_id: info.room_id.clone(),
                info: RwLock::new(info),
                chat_id: RwLock::new(None),
                signaling,
                config,
                session: RwLock::new(None),
                notifier: Notifier::new(),
                inbound_chat: Mutex::new(inbound_chat),
                directory,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.room_id
    }

    pub async fn info(&self) -> RoomInfo {
        self.inner.info.read().await.clone()
    }

    pub async fn state(&self) -> RoomState {
        self.inner.info.read().await.state
    }

    /// Subscribe to one kind of room event. Keep the returned handler to
    /// unsubscribe with [`Room::off`].
    pub fn on<F>(&self, kind: RoomEventKind, handler: F) -> Handler<RoomEvent>
    where
        F: Fn(&RoomEvent) -> convene_core::Result<()> + Send + Sync + 'static,
    {
        let handler: Handler<RoomEvent> = Arc::new(handler);
        self.inner.notifier.add(kind, handler.clone());
        handler
    }

    pub fn off(&self, kind: RoomEventKind, handler: &Handler<RoomEvent>) -> bool {
        self.inner.notifier.remove(&kind, handler)
    }

    /// Tid of the exchange currently in flight, once the room has offered
    pub async fn tracked_tid(&self) -> Option<String> {
        let session = self.inner.session.read().await.clone();
        match session {
            Some(session) => session.negotiator.tracked_tid().await,
            None => None,
        }
    }

    /// Join with a fresh media session on `engine`.
    ///
    /// Opens the chat channel, pre-allocates receive slots, sends the join
    /// offer and waits for the server to confirm membership.
    pub async fn join(&self, engine: Arc<dyn MediaEngine>, labels: Vec<TrackLabel>) -> Result<JoinReply> {
        {
            let mut info = self.inner.info.write().await;
            if !matches!(info.state, RoomState::New | RoomState::Failed) {
                return Err(Error::Rejected(format!(
                    "room {} cannot join while {:?}",
                    self.inner.room_id, info.state
                )));
            }
            self.apply_state(&mut info, RoomState::Pending);
        }
        self.inner.emit(RoomEvent::StateChanged(RoomState::Pending));
        info!(room_id = %self.inner.room_id, "Joining room");

        match self.negotiate_join(engine, &labels).await {
            Ok(reply) => {
                {
                    let mut info = self.inner.info.write().await;
                    info.local_user_id = reply.user_id.clone();
                    self.apply_state(&mut info, RoomState::Joined);
                }
                self.inner.emit(RoomEvent::StateChanged(RoomState::Joined));
                info!(room_id = %self.inner.room_id, "Joined room");
                Ok(reply)
            }
            Err(e) => {
                warn!(room_id = %self.inner.room_id, error = %e, "Join failed");
                let session = self.inner.session.write().await.take();
                if let Some(session) = session {
                    session.shutdown().await;
                }
                self.set_state(RoomState::Failed).await;
                Err(e)
            }
        }
    }

    async fn negotiate_join(&self, engine: Arc<dyn MediaEngine>, labels: &[TrackLabel]) -> Result<JoinReply> {
        let channel = engine.create_data_channel(CHAT_CHANNEL).await?;
        let pool = Arc::new(TransceiverPool::seed(engine.as_ref(), &self.inner.config.pool).await?);
        let negotiator = Negotiator::new(
            self.inner.room_id.clone(),
            engine.clone(),
            self.inner.signaling.clone(),
            self.inner.config.negotiation_timeout(),
        );
        let chat_reader = tokio::spawn(chat_reader(Arc::downgrade(&self.inner), channel.incoming));
        let session = Arc::new(Session {
            engine,
            negotiator,
            pool,
            chat: channel.sender,
            chat_reader,
        });
        let previous = self.inner.session.write().await.replace(session.clone());
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        let mut extra = Map::new();
        {
            let info = self.inner.info.read().await;
            extra.insert("name".into(), Value::String(info.name.clone()));
            extra.insert("nickname".into(), Value::String(info.nickname.clone()));
            if let Some(pin) = &info.pin {
                extra.insert("pin".into(), Value::String(pin.clone()));
            }
        }

        let ticket = self.inner.signaling.register()?;
        session
            .negotiator
            .offer(Operation::JoinRoom, &ticket.id, labels, extra)
            .await;
        let reply = self.inner.signaling.wait(ticket).await?;

        let joined: ParticipantJoined = serde_json::from_value(reply)
            .map_err(|e| Error::Protocol(format!("Malformed join reply: {}", e)))?;
        *self.inner.chat_id.write().await = joined.chat_id.clone();
        Ok(JoinReply {
            name: joined.name,
            chat_id: joined.chat_id,
            user_id: joined.user_id,
        })
    }

    /// Renegotiate the session, e.g. after adding local tracks
    pub async fn update_state(&self, labels: &[TrackLabel]) -> Result<()> {
        let session = self.session().await?;
        let ticket = self.inner.signaling.register()?;
        session
            .negotiator
            .offer(Operation::UpdateRoomState, &ticket.id, labels, Map::new())
            .await;
        self.inner.signaling.wait(ticket).await?;
        Ok(())
    }

    /// Lease a receive slot for a remote track of `kind`.
    ///
    /// Uses a pre-allocated slot when one is free. Otherwise, if
    /// `allow_create` is set, adds a transceiver and renegotiates once;
    /// if not, returns `None`.
    pub async fn demand_track(&self, kind: MediaKind, allow_create: bool) -> Result<Option<RemoteTrack>> {
        let session = self.session().await?;
        if let Some(slot) = session.pool.take(kind) {
            return Ok(Some(self.lease(&session, slot)));
        }
        if !allow_create {
            debug!(room_id = %self.inner.room_id, kind = %kind, "No vacant transceiver");
            return Ok(None);
        }

        let slot = session
            .engine
            .add_transceiver(kind, convene_core::Direction::RecvOnly)
            .await?;
        debug!(room_id = %self.inner.room_id, mid = %slot.mid, "Added transceiver, renegotiating");
        if let Err(e) = self.update_state(&[]).await {
            session.pool.put(slot);
            return Err(e);
        }
        Ok(Some(self.lease(&session, slot)))
    }

    /// Free receive slots of `kind`
    pub async fn vacant_slots(&self, kind: MediaKind) -> usize {
        match self.inner.session.read().await.as_ref() {
            Some(session) => session.pool.vacant(kind),
            None => 0,
        }
    }

    fn lease(&self, session: &Session, slot: crate::media::TransceiverHandle) -> RemoteTrack {
        RemoteTrack::lease(
            self.inner.room_id.clone(),
            slot,
            session.pool.clone(),
            self.inner.signaling.clone(),
        )
    }

    /// Send a chat message over the data channel, chunked and paced
    pub async fn send_chat(&self, body: &str) -> Result<ChatMessage> {
        let session = self.session().await?;
        let chat_id = self
            .inner
            .chat_id
            .read()
            .await
            .clone()
            .unwrap_or_else(|| self.inner.room_id.clone());
        let nickname = self.inner.info.read().await.nickname.clone();
        let message = ChatMessage::new(chat_id, nickname, body);

        let text = serde_json::to_string(&message)?;
        let group = Uuid::new_v4().to_string();
        let chunks = split_text(&group, &text, self.inner.config.chat_chunk_size);
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                if let Some(pause) = self.inner.config.chunk_pacing() {
                    tokio::time::sleep(pause).await;
                }
            }
            session.chat.send(chunk.to_json()?).await?;
        }
        debug!(room_id = %self.inner.room_id, chunks = chunks.len(), "Sent chat message");
        Ok(message)
    }

    pub async fn leave(&self) -> Result<()> {
        self.ensure_live().await?;
        self.inner
            .signaling
            .request(Operation::LeaveRoom, json!({ "roomId": self.inner.room_id }))
            .await?;
        self.dispose().await;
        Ok(())
    }

    pub async fn destroy(&self) -> Result<()> {
        self.ensure_live().await?;
        self.inner
            .signaling
            .request(Operation::DestroyRoom, json!({ "roomId": self.inner.room_id }))
            .await?;
        self.dispose().await;
        Ok(())
    }

    pub async fn assign_role(&self, nickname: &str, role: RoomRole) -> Result<()> {
        self.moderate(
            Operation::AssignRole,
            json!({ "roomId": self.inner.room_id, "nickname": nickname, "role": role }),
        )
        .await
    }

    pub async fn evict_participant(&self, nickname: &str) -> Result<()> {
        self.moderate(
            Operation::EvictParticipant,
            json!({ "roomId": self.inner.room_id, "nickname": nickname }),
        )
        .await
    }

    /// Admit or refuse someone in the waiting room
    pub async fn authorize_waiting(&self, nickname: &str, accept: bool) -> Result<()> {
        self.moderate(
            Operation::AuthorizeWaitingParticipant,
            json!({ "roomId": self.inner.room_id, "nickname": nickname, "accept": accept }),
        )
        .await
    }

    async fn moderate(&self, operation: Operation, payload: Value) -> Result<()> {
        self.ensure_live().await?;
        self.inner.signaling.request(operation, payload).await?;
        Ok(())
    }

    /// React to a server push routed to this room
    pub(crate) async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Sdp(msg) => {
                let session = self.inner.session.read().await.clone();
                match session {
                    Some(session) => session.negotiator.handle(msg).await,
                    None => debug!(room_id = %self.inner.room_id, "SDP for room without a session"),
                }
            }
            ServerEvent::RoleAssigned(assigned) => {
                self.inner.info.write().await.role = assigned.role;
                info!(room_id = %self.inner.room_id, role = %assigned.role, "Role assigned");
                self.inner.emit(RoomEvent::RoleAssigned(assigned.role));
            }
            ServerEvent::Joined(joined) => self.inner.emit(RoomEvent::ParticipantJoined(joined)),
            ServerEvent::Left(left) => {
                let ourselves = self.is_local(&left.name, left.user_id.as_deref()).await;
                self.inner.emit(RoomEvent::ParticipantLeft(left));
                if ourselves {
                    self.inner.emit(RoomEvent::Left);
                    self.dispose().await;
                }
            }
            ServerEvent::AddTracks(update) => self.inner.emit(RoomEvent::TracksAdded(update.info)),
            ServerEvent::RemoveTracks(update) => self.inner.emit(RoomEvent::TracksRemoved(update.info)),
            ServerEvent::WaitingRoomUpdate(update) => self.inner.emit(RoomEvent::WaitingRoom(update)),
            ServerEvent::OperationFailed(failure) => self.handle_failure(failure, false).await,
            other => debug!(room_id = %self.inner.room_id, event = other.name(), "Ignoring room event"),
        }
    }

    /// `rejected` tells whether the failure already completed a caller's
    /// request
    pub(crate) async fn handle_failure(&self, failure: OperationFailure, rejected: bool) {
        if failure.operation == Operation::JoinRoom && self.state().await == RoomState::Pending {
            self.set_state(RoomState::Failed).await;
        }
        match failure_reaction(&failure.error) {
            Some(reaction) => {
                warn!(room_id = %self.inner.room_id, error = %failure.error, "Room closed by server");
                self.inner.emit(reaction);
                self.dispose().await;
            }
            None if !rejected => self.inner.emit(RoomEvent::OperationFailed(failure)),
            None => {}
        }
    }

    /// Tear down the session and forget the room. Idempotent.
    pub(crate) async fn dispose(&self) {
        {
            let mut info = self.inner.info.write().await;
            if !self.apply_state(&mut info, RoomState::Disposed) {
                return;
            }
        }
        let session = self.inner.session.write().await.take();
        if let Some(session) = session {
            session.shutdown().await;
        }
        self.inner.inbound_chat().clear();
        if let Some(directory) = self.inner.directory.upgrade() {
            directory
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&self.inner.room_id);
        }
        info!(room_id = %self.inner.room_id, "Room disposed");
        self.inner.emit(RoomEvent::StateChanged(RoomState::Disposed));
    }

    async fn is_local(&self, nickname: &str, user_id: Option<&str>) -> bool {
        let info = self.inner.info.read().await;
        match (info.local_user_id.as_deref(), user_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => info.nickname == nickname,
        }
    }

    async fn ensure_live(&self) -> Result<()> {
        if self.state().await == RoomState::Disposed {
            return Err(Error::AlreadyDisposed);
        }
        Ok(())
    }

    async fn session(&self) -> Result<Arc<Session>> {
        self.ensure_live().await?;
        self.inner
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Rejected(format!("room {} has no media session", self.inner.room_id)))
    }

    async fn set_state(&self, to: RoomState) {
        let changed = {
            let mut info = self.inner.info.write().await;
            self.apply_state(&mut info, to)
        };
        if changed {
            self.inner.emit(RoomEvent::StateChanged(to));
        }
    }

    /// Returns false when nothing changed
    fn apply_state(&self, info: &mut RoomInfo, to: RoomState) -> bool {
        if info.state == to || info.state == RoomState::Disposed {
            return false;
        }
        if !is_valid_transition(info.state, to) {
            debug!(room_id = %info.room_id, from = ?info.state, to = ?to, "Ignoring room state change");
            return false;
        }
        debug!(room_id = %info.room_id, from = ?info.state, to = ?to, "Room state change");
        info.state = to;
        assert_room_invariants(info);
        true
    }
}
