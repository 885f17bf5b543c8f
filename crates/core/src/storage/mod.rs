//! SQLite storage layer for Raidroom

mod messages;
mod migrations;
mod parse;
mod rooms;
mod traits;

use crate::error::Result;
use crate::models::{ChatMessage, NewChatMessage, Plan, Room, RoomId};
use rusqlite::Connection;
use std::path::Path;
use tracing::instrument;

pub use messages::MessageStore;
pub use parse::format_datetime;
pub use rooms::RoomStore;
pub use traits::{MessageRepository, RoomRepository, Storage};

/// Main database handle
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create database at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open in-memory database (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initialize database schema via migrations
    fn init(&self) -> Result<()> {
        migrations::run_migrations(&self.conn)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Get current schema version
    pub fn schema_version(&self) -> u32 {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }

    /// Get room store
    pub fn rooms(&self) -> RoomStore<'_> {
        RoomStore::new(&self.conn)
    }

    /// Get message store
    pub fn messages(&self) -> MessageStore<'_> {
        MessageStore::new(&self.conn)
    }
}

// Implement repository traits for Database
// This enables using Database through the trait interface

impl RoomRepository for Database {
    fn create_room(&self, room: &Room) -> Result<()> {
        self.rooms().create(room)
    }

    fn find_room_by_id(&self, id: RoomId) -> Result<Option<Room>> {
        self.rooms().find_by_id(id)
    }

    fn replace_plan(&self, id: RoomId, plan: &Plan) -> Result<()> {
        self.rooms().replace_plan(id, plan)
    }
}

impl MessageRepository for Database {
    fn insert_message(&self, message: NewChatMessage) -> Result<ChatMessage> {
        self.messages().insert(message)
    }

    fn list_recent_messages(&self, room_id: RoomId, limit: u32) -> Result<Vec<ChatMessage>> {
        self.messages().list_recent(room_id, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserId;

    fn backfill<S: Storage>(store: &S, room_id: RoomId) -> Vec<ChatMessage> {
        store.list_recent_messages(room_id, 50).unwrap()
    }

    #[test]
    fn test_schema_version() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version(), 2);
    }

    #[test]
    fn test_storage_trait_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let room = Room::new(UserId::new(), "Deep Rock".into(), None);
        db.create_room(&room).unwrap();
        db.insert_message(NewChatMessage::chat(
            room.id,
            room.host_id,
            "karl".into(),
            "rock and stone".into(),
        ))
        .unwrap();

        let messages = backfill(&db, room.id);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_message_for_unknown_room_rejected() {
        let db = Database::open_in_memory().unwrap();
        let result = db.insert_message(NewChatMessage::chat(
            RoomId::new(),
            UserId::new(),
            "ghost".into(),
            "hello?".into(),
        ));
        assert!(result.is_err());
    }
}
