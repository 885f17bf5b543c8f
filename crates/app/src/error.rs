//! Error types for the room session layer

use raidroom_core::RoomId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Net(#[from] raidroom_net::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] raidroom_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Subscription rejected: {0}")]
    Rejected(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Not signed in")]
    Anonymous,

    #[error("Session released")]
    Released,
}

pub type Result<T> = std::result::Result<T, Error>;
