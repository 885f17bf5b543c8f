//! Data models for Raidroom

mod identity;
mod ids;
mod message;
mod plan;
mod presence;
mod room;

pub use identity::*;
pub use ids::*;
pub use message::*;
pub use plan::*;
pub use presence::*;
pub use room::*;
