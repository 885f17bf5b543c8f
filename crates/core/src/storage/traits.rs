//! Storage repository traits
//!
//! The relay runs every store request through these traits, so the
//! request handling does not depend on SQLite.

use crate::error::Result;
use crate::models::{ChatMessage, NewChatMessage, Plan, Room, RoomId};

/// Room repository operations
pub trait RoomRepository {
    /// Create a new room
    fn create_room(&self, room: &Room) -> Result<()>;

    /// Find room by ID
    fn find_room_by_id(&self, id: RoomId) -> Result<Option<Room>>;

    /// Overwrite a room's active plan (last writer wins)
    fn replace_plan(&self, id: RoomId, plan: &Plan) -> Result<()>;
}

/// Message repository operations
pub trait MessageRepository {
    /// Append a message, returning the stored row
    fn insert_message(&self, message: NewChatMessage) -> Result<ChatMessage>;

    /// List the newest messages for a room in ascending order
    fn list_recent_messages(&self, room_id: RoomId, limit: u32) -> Result<Vec<ChatMessage>>;
}

/// Combined storage interface used by the relay
pub trait Storage: RoomRepository + MessageRepository {}

// Blanket implementation: any type implementing all traits implements Storage
impl<T> Storage for T where T: RoomRepository + MessageRepository {}
