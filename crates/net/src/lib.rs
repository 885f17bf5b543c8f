//! Raidroom Network Library
//!
//! Realtime plumbing for planning rooms: one relay owns the room store and
//! every client talks to it over a single connection.
//!
//! # Architecture
//!
//! - **Server**: Relay that tracks presence per room topic, relays
//!   broadcasts, fronts the store and fans out row changes
//! - **Client**: One connection to a relay, usable from several tasks
//! - **Protocol**: Length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! let server = Server::start(ServerConfig::default(), Database::open(path)?).await?;
//!
//! let mut client = Client::connect(server.addr().unwrap()).await?;
//! client.handle().subscribe(room_id).await?;
//!
//! while let Some(event) = client.next_event().await {
//!     match event {
//!         ChannelEvent::Change { change, .. } => { /* handle */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod link;
pub mod protocol;
pub mod server;

pub use client::{ChannelEvent, Client, ClientHandle};
pub use error::{Error, Result};
pub use link::RoomLink;
pub use protocol::{Message, RowChange, StoreOp, StoreReply};
pub use server::{Server, ServerConfig};

/// Default port for raidroom relays
pub const DEFAULT_PORT: u16 = 7331;
