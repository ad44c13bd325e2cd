//! Room model - one conference joined through the SFU

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a Room as seen by the local client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoomState {
    /// Known locally, join not attempted yet
    #[default]
    New,
    /// Join offer sent, waiting for the server
    Pending,
    /// Server confirmed membership
    Joined,
    /// Join was rejected or negotiation broke down
    Failed,
    /// Left, destroyed or evicted; no further operations
    Disposed,
}

impl RoomState {
    /// Whether the room can still negotiate media
    pub fn is_active(&self) -> bool {
        matches!(self, RoomState::Pending | RoomState::Joined)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RoomState::Failed | RoomState::Disposed)
    }
}

/// Role assigned to the local participant by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum RoomRole {
    #[default]
    Participant = 1,
    Admin = 2,
    Owner = 3,
}

impl RoomRole {
    pub fn display_name(&self) -> &'static str {
        match self {
            RoomRole::Participant => "Participant",
            RoomRole::Admin => "Admin",
            RoomRole::Owner => "Owner",
        }
    }

    /// Admins and owners may manage other participants
    pub fn can_moderate(&self) -> bool {
        *self >= RoomRole::Admin
    }
}

impl std::fmt::Display for RoomRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Snapshot of a Room's descriptive and lifecycle fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub name: String,
    pub pin: Option<String>,
    /// Server-side id of the local participant, known after join
    pub local_user_id: Option<String>,
    pub nickname: String,
    pub creation_time: DateTime<Utc>,
    pub state: RoomState,
    pub role: RoomRole,
}

impl RoomInfo {
    pub fn new(room_id: String, name: String, nickname: String) -> Self {
        Self {
            room_id,
            name,
            pin: None,
            local_user_id: None,
            nickname,
            creation_time: Utc::now(),
            state: RoomState::New,
            role: RoomRole::Participant,
        }
    }

    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = Some(pin.into());
        self
    }

    pub fn with_creation_time(mut self, creation_time: DateTime<Utc>) -> Self {
        self.creation_time = creation_time;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_names() {
        assert_eq!(serde_json::to_string(&RoomState::Joined).unwrap(), "\"JOINED\"");
        let state: RoomState = serde_json::from_str("\"DISPOSED\"").unwrap();
        assert!(state.is_terminal());
        assert!(!state.is_active());
    }

    #[test]
    fn test_role_ordering() {
        assert!(RoomRole::Owner > RoomRole::Admin);
        assert!(RoomRole::Admin.can_moderate());
        assert!(!RoomRole::Participant.can_moderate());
        let role: RoomRole = serde_json::from_str("\"OWNER\"").unwrap();
        assert_eq!(role, RoomRole::Owner);
    }

    #[test]
    fn test_new_room_defaults() {
        let room = RoomInfo::new("r1".into(), "R".into(), "alice".into()).with_pin("1234");
        assert_eq!(room.state, RoomState::New);
        assert_eq!(room.role, RoomRole::Participant);
        assert_eq!(room.pin.as_deref(), Some("1234"));
        assert!(room.local_user_id.is_none());
    }
}
