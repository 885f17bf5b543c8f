//! Participant identity

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{PresenceRecord, UserId};

/// Who the local actor is, as resolved from the auth session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
    /// Cursor/highlight color tag (e.g. `#ff4655`)
    pub color: String,
}

impl Identity {
    pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            avatar: None,
            color: DEFAULT_COLOR.to_string(),
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    /// Presence payload published by `track()`.
    ///
    /// The relay keeps the first `online_at` of a connection across re-tracks.
    pub fn presence_record(&self) -> PresenceRecord {
        PresenceRecord {
            user_id: self.id,
            username: self.display_name.clone(),
            avatar: self.avatar.clone(),
            color: self.color.clone(),
            online_at: Utc::now(),
        }
    }
}

/// Fallback color for identities without a profile color
pub const DEFAULT_COLOR: &str = "#00ff9d";
