//! Chat message model for room chat

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{RoomId, UserId};

/// Kind of chat row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Chat,
    System,
    Gif,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Chat => "chat",
            MessageKind::System => "system",
            MessageKind::Gif => "gif",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(MessageKind::Chat),
            "system" => Some(MessageKind::System),
            "gif" => Some(MessageKind::Gif),
            _ => None,
        }
    }
}

/// A persisted, immutable chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Assigned by the store on insert
    pub created_at: DateTime<Utc>,
}

/// A message as submitted by a client, before the store assigns id and time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChatMessage {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

impl NewChatMessage {
    pub fn chat(room_id: RoomId, user_id: UserId, username: String, content: String) -> Self {
        Self {
            room_id,
            user_id,
            username,
            content,
            kind: MessageKind::Chat,
        }
    }

    /// Stamp the message with a fresh id and the given creation time
    pub fn into_message(self, created_at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            room_id: self.room_id,
            user_id: self.user_id,
            username: self.username,
            content: self.content,
            kind: self.kind,
            created_at,
        }
    }
}
