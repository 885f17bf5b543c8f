//! Ephemeral presence and cursor records (never persisted)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConnectionId, UserId};

/// Broadcast event name for cursor positions
pub const CURSOR_EVENT: &str = "cursor-pos";

/// Last payload `track()`ed by one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub username: String,
    pub avatar: Option<String>,
    pub color: String,
    pub online_at: DateTime<Utc>,
}

/// A presence record keyed by the connection that published it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub key: ConnectionId,
    pub record: PresenceRecord,
}

/// Payload of a `cursor-pos` broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    pub user_id: UserId,
    pub username: String,
    pub color: String,
    pub avatar: Option<String>,
}

/// A remote cursor as painted by the overlay
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub user_id: UserId,
    pub x: f64,
    pub y: f64,
    pub color: String,
    pub username: String,
}

impl From<CursorPosition> for Cursor {
    fn from(pos: CursorPosition) -> Self {
        Self {
            user_id: pos.user_id,
            x: pos.x,
            y: pos.y,
            color: pos.color,
            username: pos.username,
        }
    }
}
