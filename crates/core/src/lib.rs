//! Raidroom Core Library
//!
//! Room, plan and chat models, plan editing rules, and the SQLite-backed
//! room store used by the relay.

pub mod error;
pub mod invariants;
pub mod models;
pub mod storage;

pub use error::{Error, Result};
pub use models::*;
pub use storage::{Database, MessageRepository, MessageStore, RoomRepository, RoomStore, Storage};
