//! Network protocol message types
//!
//! Every text frame is a JSON envelope `{"message": <name>, "data": [<payload>]}`
//! with a single-element `data` array. Inbound frames are decoded once, here,
//! into the closed [`ServerEvent`] union; nothing past this module matches on
//! message names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use convene_core::{ParticipantTracks, RoomRole};

use crate::error::{Error, Result};
use crate::transport::Frame;

/// Handshake sent on open
pub const CONNECTION: &str = "connection";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
/// Handshake reply carrying the session's user data
pub const GET_USER_DATA: &str = "getUserData";
/// Classification of inbound binary frames
pub const BINARY_DATA: &str = "binaryData";

const SDP: &str = "SDP";
const ACK: &str = "ACK";
const OPERATION_FAILED: &str = "OPERATION_FAILED";
const ROOM_AVAILABLE: &str = "ROOM_AVAILABLE";
const ROLE_ASSIGNED: &str = "ROLE_ASSIGNED";
const JOINED: &str = "JOINED";
const LEFT: &str = "LEFT";
const ADD_TRACKS: &str = "ADD_TRACKS";
const REMOVE_TRACKS: &str = "REMOVE_TRACKS";
const WAITING_ROOM_UPDATE: &str = "WAITING_ROOM_UPDATE";

/// The text envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message: String,
    #[serde(default)]
    pub data: Vec<Value>,
}

impl Envelope {
    pub fn new(message: impl Into<String>, payload: impl Serialize) -> Result<Self> {
        Ok(Self {
            message: message.into(),
            data: vec![serde_json::to_value(payload)?],
        })
    }

    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::Text(serde_json::to_string(self)?))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// The single payload, or `null` when `data` is empty
    pub fn payload(&self) -> &Value {
        self.data.first().unwrap_or(&Value::Null)
    }
}

/// Handshake descriptor identifying the application and user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppIdentity {
    pub app_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

impl AppIdentity {
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            client_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Session data returned by the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    pub username: String,
    pub nickname: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Application-level operations; also the tag of an OPERATION_FAILED push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    CreateRoom,
    JoinRoom,
    UpdateRoomState,
    LeaveRoom,
    DestroyRoom,
    AssignRole,
    EvictParticipant,
    AuthorizeWaitingParticipant,
    DemandTrack,
    ChangeTrackState,
    ChangeQuality,
    GetMessageAttachment,
    #[serde(other)]
    Unknown,
}

impl Operation {
    /// Message name used when sending this operation
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateRoom => "createRoom",
            Operation::JoinRoom => "joinRoom",
            Operation::UpdateRoomState => "updateRoomState",
            Operation::LeaveRoom => "leaveRoom",
            Operation::DestroyRoom => "destroyRoom",
            Operation::AssignRole => "assignRole",
            Operation::EvictParticipant => "evictParticipant",
            Operation::AuthorizeWaitingParticipant => "authorizeWaitingParticipant",
            Operation::DemandTrack => "demandTrack",
            Operation::ChangeTrackState => "changeTrackState",
            Operation::ChangeQuality => "changeQuality",
            Operation::GetMessageAttachment => "getMessageAttachment",
            Operation::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session description type on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Rollback,
}

/// A session description as exchanged with the media engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            kind: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

/// SDP exchanged with the server, in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpMessage {
    pub room_id: String,
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub tid: String,
    /// Correlation id when the exchange answers a caller's request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Operation-specific fields (join credentials and the like)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SdpMessage {
    pub fn new(room_id: impl Into<String>, desc: SessionDescription, tid: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            sdp: desc.sdp,
            kind: desc.kind,
            tid: tid.into(),
            id: None,
            extra: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn description(&self) -> SessionDescription {
        SessionDescription {
            kind: self.kind,
            sdp: self.sdp.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub id: String,
}

/// Server rejected an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationFailure {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    pub operation: Operation,
    pub error: String,
    #[serde(default)]
    pub info: Option<Value>,
}

impl OperationFailure {
    pub fn to_error(&self) -> Error {
        Error::OperationFailed {
            operation: self.operation.to_string(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAvailable {
    #[serde(default)]
    pub id: Option<String>,
    pub room_id: String,
    pub name: String,
    #[serde(default)]
    pub pin: Option<String>,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub creation_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssigned {
    pub room_id: String,
    pub role: RoomRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoined {
    #[serde(default)]
    pub id: Option<String>,
    pub room_id: String,
    /// Participant nickname
    pub name: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeft {
    #[serde(default)]
    pub id: Option<String>,
    pub room_id: String,
    pub name: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracksUpdate {
    pub room_id: String,
    pub info: ParticipantTracks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingUser {
    pub nickname: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingRoomUpdate {
    pub room_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub users: Vec<WaitingUser>,
}

/// Everything the server can push, decoded at the transport boundary
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Ping,
    UserData(UserData),
    Sdp(SdpMessage),
    Ack(Ack),
    OperationFailed(OperationFailure),
    RoomAvailable(RoomAvailable),
    RoleAssigned(RoleAssigned),
    Joined(ParticipantJoined),
    Left(ParticipantLeft),
    AddTracks(TracksUpdate),
    RemoveTracks(TracksUpdate),
    WaitingRoomUpdate(WaitingRoomUpdate),
    /// Attachment bytes (`binaryData`)
    Binary(Vec<u8>),
    /// A well-formed envelope with a name this engine does not handle
    Unknown { name: String, payload: Value },
}

fn typed<T: serde::de::DeserializeOwned>(name: &str, payload: &Value) -> Result<T> {
    T::deserialize(payload)
        .map_err(|e| Error::Protocol(format!("Malformed {} payload: {}", name, e)))
}

impl ServerEvent {
    pub fn decode(frame: Frame) -> Result<Self> {
        let text = match frame {
            Frame::Binary(bytes) => return Ok(ServerEvent::Binary(bytes)),
            Frame::Text(text) => text,
        };
        let envelope = Envelope::parse(&text)?;
        let name = envelope.message.as_str();
        let payload = envelope.payload();
        let event = match name {
            PING => ServerEvent::Ping,
            GET_USER_DATA => ServerEvent::UserData(typed(name, payload)?),
            SDP => ServerEvent::Sdp(typed(name, payload)?),
            ACK => ServerEvent::Ack(typed(name, payload)?),
            OPERATION_FAILED => ServerEvent::OperationFailed(typed(name, payload)?),
            ROOM_AVAILABLE => ServerEvent::RoomAvailable(typed(name, payload)?),
            ROLE_ASSIGNED => ServerEvent::RoleAssigned(typed(name, payload)?),
            JOINED => ServerEvent::Joined(typed(name, payload)?),
            LEFT => ServerEvent::Left(typed(name, payload)?),
            ADD_TRACKS => ServerEvent::AddTracks(typed(name, payload)?),
            REMOVE_TRACKS => ServerEvent::RemoveTracks(typed(name, payload)?),
            WAITING_ROOM_UPDATE => ServerEvent::WaitingRoomUpdate(typed(name, payload)?),
            _ => ServerEvent::Unknown {
                name: envelope.message.clone(),
                payload: payload.clone(),
            },
        };
        Ok(event)
    }

    /// Room this event concerns, if any
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Sdp(m) => Some(&m.room_id),
            ServerEvent::OperationFailed(f) => f.room_id.as_deref(),
            ServerEvent::RoomAvailable(r) => Some(&r.room_id),
            ServerEvent::RoleAssigned(r) => Some(&r.room_id),
            ServerEvent::Joined(j) => Some(&j.room_id),
            ServerEvent::Left(l) => Some(&l.room_id),
            ServerEvent::AddTracks(t) | ServerEvent::RemoveTracks(t) => Some(&t.room_id),
            ServerEvent::WaitingRoomUpdate(w) => Some(&w.room_id),
            _ => None,
        }
    }

    /// Wire name, for logging
    pub fn name(&self) -> &str {
        match self {
            ServerEvent::Ping => PING,
            ServerEvent::UserData(_) => GET_USER_DATA,
            ServerEvent::Sdp(_) => SDP,
            ServerEvent::Ack(_) => ACK,
            ServerEvent::OperationFailed(_) => OPERATION_FAILED,
            ServerEvent::RoomAvailable(_) => ROOM_AVAILABLE,
            ServerEvent::RoleAssigned(_) => ROLE_ASSIGNED,
            ServerEvent::Joined(_) => JOINED,
            ServerEvent::Left(_) => LEFT,
            ServerEvent::AddTracks(_) => ADD_TRACKS,
            ServerEvent::RemoveTracks(_) => REMOVE_TRACKS,
            ServerEvent::WaitingRoomUpdate(_) => WAITING_ROOM_UPDATE,
            ServerEvent::Binary(_) => BINARY_DATA,
            ServerEvent::Unknown { name, .. } => name,
        }
    }
}

/// Build the JSON text frame for a server-side event (used by tests and
/// loopback servers)
pub fn server_frame(name: &str, payload: Value) -> Result<Frame> {
    Envelope::new(name, payload)?.to_frame()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(name: &str, payload: Value) -> Frame {
        server_frame(name, payload).unwrap()
    }

    #[test]
    fn test_envelope_shape() {
        let frame = Envelope::new(PONG, json!({})).unwrap().to_frame().unwrap();
        let Frame::Text(text) = frame else {
            panic!("expected text frame")
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["message"], "pong");
        assert_eq!(value["data"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_decode_sdp_answer() {
        let event = ServerEvent::decode(text(
            "SDP",
            json!({"roomId": "r1", "sdp": "v=0", "type": "answer", "tid": "t1"}),
        ))
        .unwrap();
        match event {
            ServerEvent::Sdp(m) => {
                assert_eq!(m.kind, SdpType::Answer);
                assert_eq!(m.tid, "t1");
                assert!(m.id.is_none());
            }
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_operation_failed() {
        let event = ServerEvent::decode(text(
            "OPERATION_FAILED",
            json!({"id": "q", "roomId": "r1", "operation": "joinRoom", "error": "destroyed"}),
        ))
        .unwrap();
        let ServerEvent::OperationFailed(f) = event else {
            panic!("Wrong event")
        };
        assert_eq!(f.operation, Operation::JoinRoom);
        assert!(matches!(f.to_error(), Error::OperationFailed { .. }));

        let odd = ServerEvent::decode(text(
            "OPERATION_FAILED",
            json!({"operation": "somethingNew", "error": "x"}),
        ))
        .unwrap();
        assert!(matches!(odd, ServerEvent::OperationFailed(f) if f.operation == Operation::Unknown));
    }

    #[test]
    fn test_decode_binary_and_unknown() {
        assert_eq!(
            ServerEvent::decode(Frame::Binary(vec![1])).unwrap(),
            ServerEvent::Binary(vec![1])
        );
        let unknown = ServerEvent::decode(text("SOMETHING", json!({"a": 1}))).unwrap();
        assert_eq!(unknown.name(), "SOMETHING");
    }

    #[test]
    fn test_malformed_payload_is_protocol_error() {
        let err = ServerEvent::decode(text("ACK", json!({"nope": true}))).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(ServerEvent::decode(Frame::Text("not json".into())).is_err());
    }

    #[test]
    fn test_join_extra_fields_flatten() {
        let msg = SdpMessage::new("r1", SessionDescription::offer("v=0"), "t1")
            .with_id("req")
            .with_extra("pin", "1234");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["type"], "offer");
        assert_eq!(value["pin"], "1234");
        assert_eq!(value["id"], "req");
    }
}
