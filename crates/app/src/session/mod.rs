//! Room session manager
//!
//! A [`RoomSession`] owns the realtime channel for one room, folds every
//! inbound event into a [`ViewState`] and exposes the mutation actions
//! (plan edits, chat, cursor) to the UI layer.
//!
//! Plan writes are optimistic: the local view changes first, then the whole
//! plan is written. The store keeps whichever write lands last and every
//! subscriber, the writer included, converges through the change feed.
//! Chat is not optimistic; a sent message shows up once its insert
//! notification comes back.

mod state;
mod throttle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use raidroom_core::invariants::assert_plan_invariants;
use raidroom_core::{
    ConnectionId, CursorPosition, Identity, MessageKind, NewChatMessage, PhaseContent, Plan,
    PresenceRecord, RoomId, UserId, Vote, CURSOR_EVENT,
};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};

use crate::adapters::{ChannelFactory, RealtimeChannel, RoomEvent, RoomStoreAdapter};
use crate::error::{Error, Result};
use crate::identity::IdentityProvider;

pub use state::{ChannelStatus, SessionEvent, ViewState};
pub use throttle::{CursorThrottle, CURSOR_INTERVAL};

/// Backoff delays for reconnect: 1s, 2s, 5s, 10s, 30s (capped)
pub const RECONNECT_DELAYS_MS: &[u64] = &[1000, 2000, 5000, 10000, 30000];

/// Chat rows loaded when a session (re)subscribes
pub const BACKFILL_LIMIT: u32 = 50;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub cursor_interval: Duration,
    pub backfill_limit: u32,
    /// Restore the last authoritative plan when a plan write fails
    pub rollback_failed_writes: bool,
    pub reconnect_delays_ms: Vec<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cursor_interval: CURSOR_INTERVAL,
            backfill_limit: BACKFILL_LIMIT,
            rollback_failed_writes: false,
            reconnect_delays_ms: RECONNECT_DELAYS_MS.to_vec(),
        }
    }
}

#[derive(Default)]
struct ReleaseSignal {
    released: AtomicBool,
    notify: Notify,
}

/// Releases a session from outside (e.g. when its view unmounts)
#[derive(Clone)]
pub struct ReleaseHandle(Arc<ReleaseSignal>);

impl ReleaseHandle {
    pub fn release(&self) {
        if !self.0.released.swap(true, Ordering::SeqCst) {
            self.0.notify.notify_one();
        }
    }

    pub fn is_released(&self) -> bool {
        self.0.released.load(Ordering::SeqCst)
    }
}

enum Wake {
    Released,
    Identity(bool),
    Channel(Option<RoomEvent>),
}

/// One room's live session
pub struct RoomSession<S, F, I>
where
    S: RoomStoreAdapter,
    F: ChannelFactory,
    I: IdentityProvider,
{
    room_id: RoomId,
    identity: I,
    identity_rx: watch::Receiver<Option<Identity>>,
    identity_live: bool,
    /// Identity the current subscription was opened for
    subscribed_as: Option<UserId>,
    /// Identity whose presence was last published
    tracked: Option<Identity>,
    store: Arc<S>,
    factory: F,
    options: SessionOptions,
    channel: Option<F::Channel>,
    view: ViewState,
    throttle: CursorThrottle,
    release: Arc<ReleaseSignal>,
}

impl<S, F, I> RoomSession<S, F, I>
where
    S: RoomStoreAdapter,
    F: ChannelFactory,
    I: IdentityProvider,
{
    pub fn new(room_id: RoomId, identity: I, store: Arc<S>, factory: F, options: SessionOptions) -> Self {
        let mut identity_rx = identity.watch();
        identity_rx.borrow_and_update();

        Self {
            room_id,
            identity,
            identity_rx,
            identity_live: true,
            subscribed_as: None,
            tracked: None,
            store,
            factory,
            throttle: CursorThrottle::new(options.cursor_interval),
            options,
            channel: None,
            view: ViewState::new(),
            release: Arc::new(ReleaseSignal::default()),
        }
    }

    /// Open the channel, wait for the subscription and seed the view
    ///
    /// There is no subscribe timeout: the session reports `Subscribing`
    /// until the relay answers or the session is released.
    #[instrument(skip(self), fields(room_id = %self.room_id))]
    pub async fn start(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.connect().await
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.current()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.channel.as_ref().map(RealtimeChannel::connection_id)
    }

    pub fn release_handle(&self) -> ReleaseHandle {
        ReleaseHandle(self.release.clone())
    }

    pub fn is_released(&self) -> bool {
        self.release.released.load(Ordering::SeqCst)
    }

    pub fn has_plan(&self) -> bool {
        self.view.has_plan()
    }

    pub fn online_user_count(&self) -> usize {
        self.view.online_user_count()
    }

    pub fn connection_count(&self) -> usize {
        self.view.connection_count()
    }

    pub fn assignable_participants(&self) -> Vec<PresenceRecord> {
        self.view.assignable_participants()
    }

    /// Wait for the next change to the view
    ///
    /// Returns the event that was applied, or `None` once the session is
    /// released or has no channel (see [`RoomSession::reconnect`]).
    pub async fn next_update(&mut self) -> Option<SessionEvent> {
        loop {
            if self.is_released() {
                self.teardown().await;
                return None;
            }

            let wake = {
                let channel = self.channel.as_mut()?;
                tokio::select! {
                    biased;
                    _ = self.release.notify.notified() => Wake::Released,
                    changed = self.identity_rx.changed(), if self.identity_live => {
                        Wake::Identity(changed.is_ok())
                    }
                    event = channel.next_event() => Wake::Channel(event),
                }
            };

            match wake {
                Wake::Released => {
                    self.teardown().await;
                    return None;
                }
                Wake::Identity(false) => {
                    debug!("Identity provider gone, keeping last identity");
                    self.identity_live = false;
                }
                Wake::Identity(true) => {
                    if let Some(event) = self.on_identity_changed().await {
                        return Some(event);
                    }
                }
                Wake::Channel(None) | Wake::Channel(Some(RoomEvent::Closed)) => {
                    warn!(room_id = %self.room_id, "Channel closed");
                    self.drop_channel().await;
                    return Some(SessionEvent::Disconnected);
                }
                Wake::Channel(Some(event)) => {
                    if let Some(event) = self.handle_event(event).await {
                        return Some(event);
                    }
                }
            }
        }
    }

    /// Optimistically replace the plan, then write it through
    ///
    /// A plan with inconsistent role data is refused before anything changes.
    /// Otherwise the local view shows `plan` immediately. A failed write is returned
    /// to the caller and, unless `rollback_failed_writes` is set, the view
    /// keeps showing the unsynced plan until the next authoritative update.
    #[instrument(skip(self, plan), fields(room_id = %self.room_id))]
    pub async fn update_plan(&mut self, plan: Plan) -> Result<()> {
        self.ensure_live()?;
        self.require_identity()?;
        plan.validate()?;

        self.view.apply(SessionEvent::LocalPlan(plan.clone()));
        let result = self.store.replace_plan(self.room_id, plan).await;

        if self.is_released() {
            debug!("Session released during plan write, discarding result");
            return result;
        }

        if let Err(e) = &result {
            warn!(error = %e, "Plan sync failed");
            if self.options.rollback_failed_writes {
                self.view.apply(SessionEvent::RollbackPlan);
            }
        }
        result
    }

    /// Regenerate one phase: new content, votes cleared, roles and assignments kept
    pub async fn reroll_phase(&mut self, index: usize, content: PhaseContent) -> Result<bool> {
        self.edit_plan(move |plan| plan.reroll_phase(index, content))
            .await
    }

    /// Cast (or change) the local user's vote on a phase
    pub async fn vote(&mut self, index: usize, vote: Vote) -> Result<bool> {
        let user = self.require_identity()?.id;
        self.edit_plan(move |plan| plan.cast_vote(index, user, vote))
            .await
    }

    pub async fn assign_role(&mut self, index: usize, role: &str, user: UserId) -> Result<bool> {
        let role = role.to_string();
        self.edit_plan(move |plan| plan.assign_role(index, &role, user))
            .await
    }

    pub async fn unassign_role(&mut self, index: usize, role: &str, user: UserId) -> Result<bool> {
        let role = role.to_string();
        self.edit_plan(move |plan| plan.unassign_role(index, &role, user))
            .await
    }

    /// Read-modify-write of the whole plan. `Ok(false)` when nothing changed.
    async fn edit_plan<E>(&mut self, edit: E) -> Result<bool>
    where
        E: FnOnce(&mut Plan) -> bool + Send,
    {
        self.ensure_live()?;
        let Some(mut plan) = self.view.room_state.clone() else {
            debug!("No plan to edit");
            return Ok(false);
        };

        if !edit(&mut plan) {
            return Ok(false);
        }
        assert_plan_invariants(&plan);

        self.update_plan(plan).await?;
        Ok(true)
    }

    /// Post a chat message. It appears once the insert notification arrives.
    pub async fn send_message(&mut self, content: &str) -> Result<()> {
        self.post(content, MessageKind::Chat).await
    }

    /// Post a GIF link as a chat row
    pub async fn send_gif(&mut self, url: &str) -> Result<()> {
        self.post(url, MessageKind::Gif).await
    }

    #[instrument(skip(self, content), fields(room_id = %self.room_id))]
    async fn post(&mut self, content: &str, kind: MessageKind) -> Result<()> {
        self.ensure_live()?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(());
        }
        let identity = self.require_identity()?;

        let message = NewChatMessage {
            room_id: self.room_id,
            user_id: identity.id,
            username: identity.display_name,
            content: content.to_string(),
            kind,
        };

        let result = self.store.insert_message(message).await;
        if let Err(e) = &result {
            warn!(error = %e, "Failed to send message");
        }
        result
    }

    /// Broadcast the local cursor, at most once per throttle window
    ///
    /// Returns whether a broadcast went out. Calls inside the window are
    /// dropped.
    pub async fn broadcast_cursor(&mut self, x: f64, y: f64) -> Result<bool> {
        self.ensure_live()?;
        let Some(identity) = self.current_identity() else {
            return Ok(false);
        };
        if self.channel.is_none() || !self.throttle.should_send() {
            return Ok(false);
        }

        let payload = serde_json::to_value(CursorPosition {
            x,
            y,
            user_id: identity.id,
            username: identity.display_name,
            color: identity.color,
            avatar: identity.avatar,
        })?;

        let Some(channel) = self.channel.as_mut() else {
            return Ok(false);
        };
        channel.send_broadcast(CURSOR_EVENT, payload).await?;
        Ok(true)
    }

    /// Re-open the channel with capped backoff until it subscribes or the
    /// session is released
    #[instrument(skip(self), fields(room_id = %self.room_id))]
    pub async fn reconnect(&mut self) -> Result<()> {
        let mut attempt = 0;
        loop {
            self.ensure_live()?;
            info!(attempt = attempt + 1, "Reconnect attempt");

            self.drop_channel().await;
            match self.connect().await {
                Ok(()) => {
                    info!("Reconnect successful");
                    return Ok(());
                }
                Err(Error::Released) => return Err(Error::Released),
                Err(e) => debug!(error = %e, "Reconnect attempt failed"),
            }

            let delay = backoff_delay(&self.options.reconnect_delays_ms, attempt);
            info!(delay_ms = delay.as_millis() as u64, "Reconnect backoff");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.release.notify.notified() => return Err(Error::Released),
            }

            attempt += 1;
        }
    }

    /// Tear the session down. Later events and in-flight results are discarded.
    pub async fn release(&mut self) {
        self.release_handle().release();
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if self.channel.is_some() {
            info!(room_id = %self.room_id, "Releasing room session");
        }
        self.drop_channel().await;
    }

    async fn drop_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.release().await;
        }
        self.subscribed_as = None;
        self.tracked = None;
        self.view.apply(SessionEvent::Disconnected);
    }

    async fn connect(&mut self) -> Result<()> {
        self.view.apply(SessionEvent::Subscribing);

        let mut channel = match self.factory.open(self.room_id).await {
            Ok(channel) => channel,
            Err(e) => {
                self.view.apply(SessionEvent::Disconnected);
                return Err(e);
            }
        };
        if let Err(e) = channel.subscribe().await {
            channel.release().await;
            self.view.apply(SessionEvent::Disconnected);
            return Err(e);
        }

        loop {
            let event = tokio::select! {
                _ = self.release.notify.notified() => {
                    channel.release().await;
                    return Err(Error::Released);
                }
                event = channel.next_event() => event,
            };

            match event {
                Some(RoomEvent::Subscribed) => break,
                Some(RoomEvent::Rejected(reason)) => {
                    warn!(room_id = %self.room_id, reason = %reason, "Subscription rejected");
                    channel.release().await;
                    self.view.apply(SessionEvent::Disconnected);
                    return Err(Error::Rejected(reason));
                }
                Some(RoomEvent::Closed) | None => {
                    channel.release().await;
                    self.view.apply(SessionEvent::Disconnected);
                    return Err(Error::ChannelClosed);
                }
                Some(other) => debug!(?other, "Event before subscription, skipping"),
            }
        }

        info!(
            room_id = %self.room_id,
            connection_id = %channel.connection_id(),
            "Subscribed to room"
        );
        self.channel = Some(channel);
        self.subscribed_as = self.current_identity().map(|i| i.id);
        self.view.apply(SessionEvent::Subscribed);
        self.throttle.reset();

        self.track_current().await;
        self.refresh().await;
        Ok(())
    }

    /// Re-read the room and chat backfill from the store
    async fn refresh(&mut self) {
        match self.store.fetch_room(self.room_id).await {
            Ok(room) => {
                if self.is_released() {
                    return;
                }
                if room.is_none() {
                    info!(room_id = %self.room_id, "Room not found, waiting for a plan");
                }
                self.view.apply(SessionEvent::RoomLoaded(room));
            }
            Err(e) => warn!(error = %e, "Failed to fetch room"),
        }

        match self
            .store
            .fetch_messages(self.room_id, self.options.backfill_limit)
            .await
        {
            Ok(messages) => {
                if self.is_released() {
                    return;
                }
                debug!(count = messages.len(), "Chat backfill loaded");
                self.view.apply(SessionEvent::Backfill(messages));
            }
            Err(e) => warn!(error = %e, "Failed to load chat backfill"),
        }
    }

    /// Publish our presence payload (replaces any earlier one for this connection)
    async fn track_current(&mut self) {
        let Some(identity) = self.current_identity() else {
            debug!("Anonymous, not tracking presence");
            return;
        };
        let Some(channel) = self.channel.as_mut() else {
            return;
        };

        match channel.track(identity.presence_record()).await {
            Ok(()) => self.tracked = Some(identity),
            Err(e) => warn!(error = %e, "Failed to track presence"),
        }
    }

    async fn on_identity_changed(&mut self) -> Option<SessionEvent> {
        let next = self.identity_rx.borrow_and_update().clone();
        let next_id = next.as_ref().map(|i| i.id);

        if next_id != self.subscribed_as {
            info!(user_id = ?next_id, "Identity changed, re-subscribing");
            self.drop_channel().await;
            return match self.connect().await {
                Ok(()) => Some(SessionEvent::Subscribed),
                Err(e) => {
                    warn!(error = %e, "Re-subscribe failed");
                    Some(SessionEvent::Disconnected)
                }
            };
        }

        if next != self.tracked {
            debug!("Identity details changed, re-tracking");
            self.track_current().await;
        }
        None
    }

    async fn handle_event(&mut self, event: RoomEvent) -> Option<SessionEvent> {
        let event = match event {
            RoomEvent::Subscribed => {
                self.view.apply(SessionEvent::Subscribed);
                self.track_current().await;
                return Some(SessionEvent::Subscribed);
            }
            RoomEvent::Rejected(reason) => {
                warn!(reason = %reason, "Subscription rejected");
                self.drop_channel().await;
                return Some(SessionEvent::Disconnected);
            }
            RoomEvent::PresenceSync(entries) => SessionEvent::PresenceSync(entries),
            RoomEvent::PresenceJoin { key, record } => SessionEvent::PresenceJoin { key, record },
            RoomEvent::PresenceLeave { key, record } => SessionEvent::PresenceLeave { key, record },
            RoomEvent::Broadcast {
                event,
                payload,
                from,
            } => {
                if event != CURSOR_EVENT {
                    debug!(event = %event, "Ignoring broadcast");
                    return None;
                }
                let key = from?;
                match serde_json::from_value::<CursorPosition>(payload) {
                    Ok(position) => SessionEvent::CursorMoved { key, position },
                    Err(e) => {
                        warn!(error = %e, "Malformed cursor payload");
                        return None;
                    }
                }
            }
            RoomEvent::RoomUpdated(room) => {
                if room.id != self.room_id {
                    return None;
                }
                SessionEvent::RoomLoaded(Some(room))
            }
            RoomEvent::MessageInserted(message) => {
                if message.room_id != self.room_id {
                    return None;
                }
                SessionEvent::MessageInserted(message)
            }
            RoomEvent::Closed => return None,
        };

        self.view.apply(event.clone());
        Some(event)
    }

    fn current_identity(&self) -> Option<Identity> {
        self.identity_rx.borrow().clone()
    }

    fn require_identity(&self) -> Result<Identity> {
        self.current_identity().ok_or(Error::Anonymous)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            return Err(Error::Released);
        }
        Ok(())
    }
}

/// Delay before reconnect attempt `attempt` (0-based), with up to 10% jitter
fn backoff_delay(delays_ms: &[u64], attempt: usize) -> Duration {
    let delays = if delays_ms.is_empty() {
        RECONNECT_DELAYS_MS
    } else {
        delays_ms
    };
    let base = delays[attempt.min(delays.len() - 1)];
    let jitter = if base >= 10 {
        rand::thread_rng().gen_range(0..=base / 10)
    } else {
        0
    };
    Duration::from_millis(base + jitter)
}
