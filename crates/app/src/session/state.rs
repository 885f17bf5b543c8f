//! Session view state and the reducer that merges events into it
//!
//! Every inbound channel event and every local optimistic write becomes a
//! [`SessionEvent`] applied in order by [`ViewState::apply`]. Nothing else
//! mutates the view.

use std::collections::{HashMap, HashSet};

use raidroom_core::invariants::assert_chat_invariants;
use raidroom_core::{
    ChatMessage, ConnectionId, Cursor, CursorPosition, Plan, PresenceEntry, PresenceRecord, Room,
    UserId,
};
use tracing::{debug, trace};

/// Channel lifecycle as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    #[default]
    Disconnected,
    Subscribing,
    Subscribed,
}

/// Ordered input to the reducer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Subscribing,
    Subscribed,
    Disconnected,
    /// Full presence snapshot; replaces everything known before
    PresenceSync(Vec<PresenceEntry>),
    PresenceJoin {
        key: ConnectionId,
        record: PresenceRecord,
    },
    PresenceLeave {
        key: ConnectionId,
        record: PresenceRecord,
    },
    CursorMoved {
        key: ConnectionId,
        position: CursorPosition,
    },
    /// Authoritative room row (initial fetch or change notification)
    RoomLoaded(Option<Room>),
    MessageInserted(ChatMessage),
    Backfill(Vec<ChatMessage>),
    /// Optimistic local plan write
    LocalPlan(Plan),
    /// Restore the last authoritative plan after a failed write
    RollbackPlan,
}

/// Everything a room view renders from
#[derive(Debug, Clone, Default)]
pub struct ViewState {
    pub status: ChannelStatus,
    /// Raw presence: one entry per connection, not per user
    pub participants: HashMap<ConnectionId, PresenceRecord>,
    pub cursors: HashMap<ConnectionId, Cursor>,
    pub room: Option<Room>,
    /// Last known plan, local optimistic writes included
    pub room_state: Option<Plan>,
    /// Ascending by `created_at`, unique by id
    pub chat_messages: Vec<ChatMessage>,
    confirmed_plan: Option<Plan>,
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one event into the view
    pub fn apply(&mut self, event: SessionEvent) {
        trace!(?event, "Applying session event");
        match event {
            SessionEvent::Subscribing => {
                self.status = ChannelStatus::Subscribing;
                self.participants.clear();
                self.cursors.clear();
            }
            SessionEvent::Subscribed => {
                self.status = ChannelStatus::Subscribed;
            }
            SessionEvent::Disconnected => {
                self.status = ChannelStatus::Disconnected;
                self.participants.clear();
                self.cursors.clear();
            }
            SessionEvent::PresenceSync(entries) => {
                self.participants = entries
                    .into_iter()
                    .map(|entry| (entry.key, entry.record))
                    .collect();
                let participants = &self.participants;
                self.cursors.retain(|key, _| participants.contains_key(key));
            }
            SessionEvent::PresenceJoin { key, record } => {
                debug!(connection_id = %key, username = %record.username, "Participant joined");
                self.participants.insert(key, record);
            }
            SessionEvent::PresenceLeave { key, record } => {
                debug!(connection_id = %key, username = %record.username, "Participant left");
                self.participants.remove(&key);
                // Only this connection's cursor; other tabs of the same user stay
                self.cursors.remove(&key);
            }
            SessionEvent::CursorMoved { key, position } => {
                self.cursors.insert(key, Cursor::from(position));
            }
            SessionEvent::RoomLoaded(room) => {
                let plan = room.as_ref().and_then(|r| r.active_plan.clone());
                self.confirmed_plan = plan.clone();
                self.room_state = plan;
                self.room = room;
            }
            SessionEvent::MessageInserted(message) => {
                self.insert_message(message);
                assert_chat_invariants(&self.chat_messages);
            }
            SessionEvent::Backfill(messages) => {
                for message in messages {
                    self.insert_message(message);
                }
                assert_chat_invariants(&self.chat_messages);
            }
            SessionEvent::LocalPlan(plan) => {
                self.room_state = Some(plan);
            }
            SessionEvent::RollbackPlan => {
                self.room_state = self.confirmed_plan.clone();
            }
        }
    }

    fn insert_message(&mut self, message: ChatMessage) {
        if self.chat_messages.iter().any(|m| m.id == message.id) {
            return;
        }
        // After any equal timestamps, so ties keep arrival order
        let pos = self
            .chat_messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.chat_messages.insert(pos, message);
    }

    pub fn is_connected(&self) -> bool {
        self.status == ChannelStatus::Subscribed
    }

    /// A plan exists and has at least one phase
    pub fn has_plan(&self) -> bool {
        self.room_state.as_ref().is_some_and(Plan::has_phases)
    }

    /// No plan yet: the view waits for the host to start one
    pub fn is_waiting(&self) -> bool {
        !self.has_plan()
    }

    pub fn connection_count(&self) -> usize {
        self.participants.len()
    }

    /// Distinct humans online (several tabs count once)
    pub fn online_user_count(&self) -> usize {
        self.participants
            .values()
            .map(|r| r.user_id)
            .collect::<HashSet<UserId>>()
            .len()
    }

    /// One record per user, earliest connection first, for role pickers
    pub fn assignable_participants(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<&PresenceRecord> = self.participants.values().collect();
        records.sort_by(|a, b| {
            a.online_at
                .cmp(&b.online_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });

        let mut seen = HashSet::new();
        records
            .into_iter()
            .filter(|r| seen.insert(r.user_id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use raidroom_core::{MessageKind, Phase, PhaseContent, RoomId};
    use uuid::Uuid;

    fn record(user_id: UserId, name: &str, secs: i64) -> PresenceRecord {
        PresenceRecord {
            user_id,
            username: name.to_string(),
            avatar: None,
            color: "#fff".into(),
            online_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn entry(key: ConnectionId, record: PresenceRecord) -> PresenceEntry {
        PresenceEntry { key, record }
    }

    fn position(user_id: UserId, x: f64) -> CursorPosition {
        CursorPosition {
            x,
            y: 1.0,
            user_id,
            username: "u".into(),
            color: "#fff".into(),
            avatar: None,
        }
    }

    fn message(room_id: RoomId, content: &str, offset_ms: i64) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            user_id: UserId::new(),
            username: "u".into(),
            content: content.into(),
            kind: MessageKind::Chat,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap()
                + Duration::milliseconds(offset_ms),
        }
    }

    fn plan(phases: usize) -> Plan {
        Plan {
            title: "Op".into(),
            game: "Destiny 2".into(),
            raid: "Vault".into(),
            vibe: "chaos".into(),
            squad_size: 6,
            phases: (0..phases)
                .map(|i| {
                    Phase::new(
                        PhaseContent {
                            name: format!("p{}", i),
                            text: "t".into(),
                            quip: "q".into(),
                            time: 5,
                            meme: None,
                        },
                        vec!["tank".into()],
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn sync_replaces_inferred_presence() {
        let mut view = ViewState::new();
        let stale = ConnectionId::new();
        let kept = ConnectionId::new();
        let user = UserId::new();

        view.apply(SessionEvent::PresenceJoin {
            key: stale,
            record: record(UserId::new(), "ghost", 0),
        });
        view.apply(SessionEvent::CursorMoved {
            key: stale,
            position: position(user, 3.0),
        });

        view.apply(SessionEvent::PresenceSync(vec![entry(
            kept,
            record(user, "ana", 1),
        )]));

        assert_eq!(view.participants.len(), 1);
        assert!(view.participants.contains_key(&kept));
        assert!(view.cursors.is_empty());
    }

    #[test]
    fn leave_removes_only_that_connections_cursor() {
        let mut view = ViewState::new();
        let user = UserId::new();
        let tab_a = ConnectionId::new();
        let tab_b = ConnectionId::new();

        view.apply(SessionEvent::PresenceSync(vec![
            entry(tab_a, record(user, "ana", 0)),
            entry(tab_b, record(user, "ana", 1)),
        ]));
        view.apply(SessionEvent::CursorMoved {
            key: tab_a,
            position: position(user, 1.0),
        });
        view.apply(SessionEvent::CursorMoved {
            key: tab_b,
            position: position(user, 2.0),
        });

        view.apply(SessionEvent::PresenceLeave {
            key: tab_a,
            record: record(user, "ana", 0),
        });

        assert!(!view.cursors.contains_key(&tab_a));
        assert_eq!(view.cursors[&tab_b].x, 2.0);
        assert_eq!(view.online_user_count(), 1);
    }

    #[test]
    fn newer_cursor_overwrites_older() {
        let mut view = ViewState::new();
        let key = ConnectionId::new();
        let user = UserId::new();

        view.apply(SessionEvent::CursorMoved {
            key,
            position: position(user, 1.0),
        });
        view.apply(SessionEvent::CursorMoved {
            key,
            position: position(user, 9.0),
        });

        assert_eq!(view.cursors.len(), 1);
        assert_eq!(view.cursors[&key].x, 9.0);
    }

    #[test]
    fn counts_and_assignable_participants_dedupe_by_user() {
        let mut view = ViewState::new();
        let ana = UserId::new();
        let bo = UserId::new();

        view.apply(SessionEvent::PresenceSync(vec![
            entry(ConnectionId::new(), record(ana, "ana", 0)),
            entry(ConnectionId::new(), record(bo, "bo", 1)),
            entry(ConnectionId::new(), record(ana, "ana", 2)),
        ]));

        assert_eq!(view.connection_count(), 3);
        assert_eq!(view.online_user_count(), 2);

        let names: Vec<String> = view
            .assignable_participants()
            .into_iter()
            .map(|r| r.username)
            .collect();
        assert_eq!(names, vec!["ana", "bo"]);
    }

    #[test]
    fn chat_stays_sorted_and_unique() {
        let mut view = ViewState::new();
        let room_id = RoomId::new();
        let early = message(room_id, "early", 0);
        let middle = message(room_id, "middle", 10);
        let late = message(room_id, "late", 20);

        view.apply(SessionEvent::MessageInserted(late.clone()));
        view.apply(SessionEvent::Backfill(vec![early.clone(), middle.clone()]));
        view.apply(SessionEvent::MessageInserted(middle.clone()));

        let contents: Vec<&str> = view
            .chat_messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["early", "middle", "late"]);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut view = ViewState::new();
        let room_id = RoomId::new();
        let first = message(room_id, "first", 5);
        let mut second = message(room_id, "second", 0);
        second.created_at = first.created_at;

        view.apply(SessionEvent::MessageInserted(first));
        view.apply(SessionEvent::MessageInserted(second));

        assert_eq!(view.chat_messages[1].content, "second");
    }

    #[test]
    fn missing_room_is_waiting() {
        let mut view = ViewState::new();
        view.apply(SessionEvent::RoomLoaded(None));
        assert!(view.is_waiting());

        let room = Room::new(UserId::new(), "Destiny 2".into(), Some(plan(0)));
        view.apply(SessionEvent::RoomLoaded(Some(room)));
        assert!(view.is_waiting());
    }

    #[test]
    fn local_plan_is_visible_until_authoritative_update() {
        let mut view = ViewState::new();
        let room = Room::new(UserId::new(), "Destiny 2".into(), None);
        view.apply(SessionEvent::RoomLoaded(Some(room.clone())));

        view.apply(SessionEvent::LocalPlan(plan(3)));
        assert!(view.has_plan());
        assert_eq!(view.room_state.as_ref().unwrap().phases.len(), 3);

        let authoritative = Room {
            active_plan: Some(plan(2)),
            ..room
        };
        view.apply(SessionEvent::RoomLoaded(Some(authoritative)));
        assert_eq!(view.room_state.as_ref().unwrap().phases.len(), 2);
    }

    #[test]
    fn rollback_restores_last_authoritative_plan() {
        let mut view = ViewState::new();
        let room = Room::new(UserId::new(), "Destiny 2".into(), Some(plan(1)));
        view.apply(SessionEvent::RoomLoaded(Some(room)));

        view.apply(SessionEvent::LocalPlan(plan(4)));
        view.apply(SessionEvent::RollbackPlan);

        assert_eq!(view.room_state.as_ref().unwrap().phases.len(), 1);
    }

    #[test]
    fn disconnect_clears_ephemeral_state_only() {
        let mut view = ViewState::new();
        let room_id = RoomId::new();
        let key = ConnectionId::new();

        view.apply(SessionEvent::Subscribed);
        view.apply(SessionEvent::PresenceJoin {
            key,
            record: record(UserId::new(), "ana", 0),
        });
        view.apply(SessionEvent::MessageInserted(message(room_id, "hi", 0)));
        view.apply(SessionEvent::Disconnected);

        assert!(!view.is_connected());
        assert!(view.participants.is_empty());
        assert_eq!(view.chat_messages.len(), 1);
    }
}
