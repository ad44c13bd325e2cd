//! Chat message model carried over a room's data channel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reference to an attachment stored on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub id: String,
    pub name: String,
    pub size: u64,
}

/// A chat message exchanged inside a Room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_id: String,
    pub nickname: String,
    pub body: String,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
}

impl ChatMessage {
    pub fn new(chat_id: impl Into<String>, nickname: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            nickname: nickname.into(),
            body: body.into(),
            date: Utc::now(),
            attachments: Vec::new(),
        }
    }
}
