//! Room chat storage operations

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection};
use tracing::instrument;

use super::parse::{
    format_datetime, kind_from_str, parse_datetime, parse_room_id, parse_user_id, parse_uuid,
};
use crate::error::Result;
use crate::models::{ChatMessage, NewChatMessage, RoomId};

pub struct MessageStore<'a> {
    conn: &'a Connection,
}

impl<'a> MessageStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append a message; the store assigns id and creation time.
    ///
    /// The creation time never goes backwards within a room, so ordering by
    /// `created_at` equals commit order even if the wall clock steps back.
    #[instrument(skip(self, message), fields(room_id = %message.room_id))]
    pub fn insert(&self, message: NewChatMessage) -> Result<ChatMessage> {
        // Stored rows keep microseconds; the returned row must match them
        let now = Utc::now().trunc_subsecs(6);
        let created_at = match self.latest_created_at(message.room_id)? {
            Some(last) if last > now => last,
            _ => now,
        };
        let message = message.into_message(created_at);

        self.conn.execute(
            "INSERT INTO room_messages (id, room_id, user_id, username, content, type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_string(),
                message.room_id.to_string(),
                message.user_id.to_string(),
                message.username,
                message.content,
                message.kind.as_str(),
                format_datetime(message.created_at),
            ],
        )?;
        Ok(message)
    }

    fn latest_created_at(&self, room_id: RoomId) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(created_at) FROM room_messages WHERE room_id = ?1",
            params![room_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(latest.map(|s| parse_datetime(&s)).transpose()?)
    }

    /// The newest `limit` messages of a room, oldest first
    #[instrument(skip(self))]
    pub fn list_recent(&self, room_id: RoomId, limit: u32) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, room_id, user_id, username, content, type, created_at
             FROM room_messages
             WHERE room_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;

        let mut messages = stmt
            .query_map(params![room_id.to_string(), limit], Self::map_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Reverse to get chronological order
        messages.reverse();
        Ok(messages)
    }

    fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
        Ok(ChatMessage {
            id: parse_uuid(&row.get::<_, String>(0)?)?,
            room_id: parse_room_id(&row.get::<_, String>(1)?)?,
            user_id: parse_user_id(&row.get::<_, String>(2)?)?,
            username: row.get(3)?,
            content: row.get(4)?,
            kind: kind_from_str(&row.get::<_, String>(5)?),
            created_at: parse_datetime(&row.get::<_, String>(6)?)?,
        })
    }
}
