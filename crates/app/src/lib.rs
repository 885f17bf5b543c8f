//! Raidroom application layer
//!
//! The room session manager and everything it is wired to: identity,
//! store and channel adapters over the relay, and configuration.

pub mod adapters;
pub mod config;
pub mod error;
pub mod identity;
pub mod session;
pub mod share;

pub use adapters::{
    ChannelFactory, NetChannel, NetChannelFactory, RealtimeChannel, RemoteStore, RoomEvent,
    RoomStoreAdapter, Transport,
};
pub use config::Config;
pub use error::{Error, Result};
pub use identity::{IdentityProvider, SessionIdentity};
pub use session::{
    ChannelStatus, CursorThrottle, ReleaseHandle, RoomSession, SessionEvent, SessionOptions,
    ViewState,
};
