//! Media line and track descriptors shared with the server

use serde::{Deserialize, Serialize};

/// Kind of media carried by a transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a media line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    /// SDP attribute value (`a=<value>`)
    pub fn as_attr(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }
}

/// Simulcast layer a receiver asks the server to forward
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quality(pub String);

impl Quality {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Description of a remote track published in the room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub quality: Vec<Quality>,
}

/// Tracks added or removed by one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantTracks {
    pub nickname: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub info: Vec<TrackInfo>,
}

/// Application label attached to one local media line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackLabel {
    pub mid: String,
    pub label: String,
}

impl TrackLabel {
    pub fn new(mid: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            mid: mid.into(),
            label: label.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_info_from_server_json() {
        let json = r#"{"id":"t1","type":"video","mid":"3","contentType":"screen","quality":["low","high"]}"#;
        let track: TrackInfo = serde_json::from_str(json).unwrap();
        assert_eq!(track.kind, MediaKind::Video);
        assert_eq!(track.mid.as_deref(), Some("3"));
        assert_eq!(track.content_type.as_deref(), Some("screen"));
        assert!(!track.mute);
        assert_eq!(track.quality, vec![Quality::new("low"), Quality::new("high")]);
    }

    #[test]
    fn test_direction_attr() {
        assert_eq!(Direction::SendOnly.as_attr(), "sendonly");
        assert_eq!(MediaKind::Audio.to_string(), "audio");
    }
}
