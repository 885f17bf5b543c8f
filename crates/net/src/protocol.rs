//! Network protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.
//!
//! A connection carries three independent event classes per subscribed room:
//! presence (who is connected), broadcast (ephemeral, never persisted) and
//! change notifications (committed row mutations). It also carries
//! request/response pairs against the room store.

use raidroom_core::{
    ChatMessage, ConnectionId, NewChatMessage, Plan, PresenceEntry, PresenceRecord, Room, RoomId,
    UserId,
};
use serde::{Deserialize, Serialize};

/// A committed row mutation pushed to room subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum RowChange {
    /// `UPDATE` on `rooms` filtered by `id`
    #[serde(rename = "UPDATE")]
    RoomUpdated(Room),
    /// `INSERT` on `room_messages` filtered by `room_id`
    #[serde(rename = "INSERT")]
    MessageInserted(ChatMessage),
}

/// Operations against the relational room store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum StoreOp {
    FetchRoom {
        room_id: RoomId,
    },
    ReplacePlan {
        room_id: RoomId,
        plan: Plan,
    },
    FetchMessages {
        room_id: RoomId,
        limit: u32,
    },
    InsertMessage {
        message: NewChatMessage,
    },
    CreateRoom {
        host_id: UserId,
        game: String,
        plan: Option<Plan>,
    },
}

/// Store operation outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum StoreReply {
    Ok,
    Room { room: Room },
    Messages { messages: Vec<ChatMessage> },
    NotFound { what: String },
    Failed { error: String },
}

/// Network protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// First frame sent by the server on every connection
    Welcome { connection_id: ConnectionId },

    /// Client joins a room topic
    Subscribe { room_id: RoomId },

    /// Server confirms a subscription
    Subscribed { room_id: RoomId },

    /// Server refuses a subscription (e.g. room full)
    SubscribeRejected { room_id: RoomId, reason: String },

    /// Client leaves a room topic
    Unsubscribe { room_id: RoomId },

    /// Client publishes (or replaces) its presence payload
    Track {
        room_id: RoomId,
        record: PresenceRecord,
    },

    /// Full presence snapshot, supersedes any earlier join/leave
    PresenceSync {
        room_id: RoomId,
        entries: Vec<PresenceEntry>,
    },

    /// A connection published presence for the first time
    PresenceJoin {
        room_id: RoomId,
        key: ConnectionId,
        record: PresenceRecord,
    },

    /// A connection's presence went away
    PresenceLeave {
        room_id: RoomId,
        key: ConnectionId,
        record: PresenceRecord,
    },

    /// Ephemeral event fanned out to the other subscribers.
    /// `from` is stamped by the server.
    Broadcast {
        room_id: RoomId,
        event: String,
        payload: serde_json::Value,
        #[serde(default)]
        from: Option<ConnectionId>,
    },

    /// Durable row change, delivered to every subscriber including the writer
    Change { room_id: RoomId, change: RowChange },

    /// Store request
    Request { id: u64, op: StoreOp },

    /// Store response, correlated by `id`
    Response { id: u64, reply: StoreReply },

    /// Ping to keep connection alive
    Ping,

    /// Pong response to ping
    Pong,

    /// Server is shutting down
    ServerShutdown,
}

impl Message {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use raidroom_core::{Identity, MessageKind, Phase, PhaseContent, Vote};

    fn plan_with_vote(user: UserId) -> Plan {
        let mut plan = Plan {
            title: "Op".to_string(),
            game: "Destiny 2".to_string(),
            raid: "Crota".to_string(),
            vibe: "cursed".to_string(),
            squad_size: 6,
            phases: vec![Phase::new(
                PhaseContent {
                    name: "Bridge".to_string(),
                    text: "Carry the sword".to_string(),
                    quip: "drop it".to_string(),
                    time: 12,
                    meme: None,
                },
                vec!["Swordbearer".to_string()],
            )],
        };
        plan.cast_vote(0, user, Vote::Keep);
        plan.assign_role(0, "Swordbearer", user);
        plan
    }

    #[test]
    fn test_change_notification_survives_the_wire() {
        let user = UserId::new();
        let mut room = Room::new(user, "Destiny 2".to_string(), None);
        room.active_plan = Some(plan_with_vote(user));
        let msg = Message::Change {
            room_id: room.id,
            change: RowChange::RoomUpdated(room.clone()),
        };

        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        match decoded {
            Message::Change {
                change: RowChange::RoomUpdated(got),
                ..
            } => {
                let plan = got.active_plan.unwrap();
                assert_eq!(plan.phases[0].votes.get(&user), Some(&Vote::Keep));
                assert!(plan.phases[0].is_assigned("Swordbearer", user));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_message_insert_event_tag() {
        let room_id = RoomId::new();
        let message = NewChatMessage::chat(room_id, UserId::new(), "ana".into(), "hi".into())
            .into_message(Utc::now());
        let msg = Message::Change {
            room_id,
            change: RowChange::MessageInserted(message),
        };

        let value: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "Change");
        assert_eq!(value["change"]["event"], "INSERT");
        assert_eq!(value["change"]["type"], MessageKind::Chat.as_str());
    }

    #[test]
    fn test_broadcast_without_from_defaults() {
        let room_id = RoomId::new();
        let json = format!(
            r#"{{"type":"Broadcast","room_id":"{}","event":"cursor-pos","payload":{{"x":1.0}}}}"#,
            room_id
        );
        match Message::from_bytes(json.as_bytes()).unwrap() {
            Message::Broadcast { from, event, .. } => {
                assert!(from.is_none());
                assert_eq!(event, "cursor-pos");
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_presence_sync_keys_by_connection() {
        let identity = Identity::new(UserId::new(), "ana");
        let entries = vec![
            PresenceEntry {
                key: ConnectionId::new(),
                record: identity.presence_record(),
            },
            PresenceEntry {
                key: ConnectionId::new(),
                record: identity.presence_record(),
            },
        ];
        let msg = Message::PresenceSync {
            room_id: RoomId::new(),
            entries,
        };

        match Message::from_bytes(&msg.to_bytes().unwrap()).unwrap() {
            Message::PresenceSync { entries, .. } => {
                assert_eq!(entries.len(), 2);
                assert_ne!(entries[0].key, entries[1].key);
                assert_eq!(entries[0].record.user_id, entries[1].record.user_id);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }
}
