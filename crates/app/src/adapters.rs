//! Seams between the session manager and the outside world
//!
//! The session only sees these traits. The net-backed implementations talk
//! to a relay; tests can plug in anything else.

use std::future::Future;
use std::net::SocketAddr;

use raidroom_core::{
    ChatMessage, ConnectionId, NewChatMessage, Plan, PresenceEntry, PresenceRecord, Room, RoomId,
    UserId,
};
use raidroom_net::{ChannelEvent, Client, ClientHandle, RowChange, Server};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;

/// Point reads and writes against the room store
pub trait RoomStoreAdapter: Send + Sync + 'static {
    /// `Ok(None)` when the room does not exist
    fn fetch_room(&self, room_id: RoomId) -> impl Future<Output = Result<Option<Room>>> + Send;

    /// Whole-document overwrite; last writer wins
    fn replace_plan(&self, room_id: RoomId, plan: Plan)
        -> impl Future<Output = Result<()>> + Send;

    /// Newest `limit` messages in ascending order
    fn fetch_messages(
        &self,
        room_id: RoomId,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<ChatMessage>>> + Send;

    /// Durable append. The row comes back through the change feed.
    fn insert_message(&self, message: NewChatMessage) -> impl Future<Output = Result<()>> + Send;

    fn create_room(
        &self,
        host_id: UserId,
        game: String,
        plan: Option<Plan>,
    ) -> impl Future<Output = Result<Room>> + Send;
}

/// Room-scoped event from a realtime channel
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Subscribed,
    Rejected(String),
    PresenceSync(Vec<PresenceEntry>),
    PresenceJoin {
        key: ConnectionId,
        record: PresenceRecord,
    },
    PresenceLeave {
        key: ConnectionId,
        record: PresenceRecord,
    },
    Broadcast {
        event: String,
        payload: serde_json::Value,
        from: Option<ConnectionId>,
    },
    RoomUpdated(Room),
    MessageInserted(ChatMessage),
    /// Transport gone; no more events will follow
    Closed,
}

/// One logical pub/sub channel for one room
pub trait RealtimeChannel: Send + 'static {
    fn connection_id(&self) -> ConnectionId;

    fn subscribe(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Publish (or replace) this connection's presence payload
    fn track(&mut self, record: PresenceRecord) -> impl Future<Output = Result<()>> + Send;

    fn send_broadcast(
        &mut self,
        event: &str,
        payload: serde_json::Value,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Next event for this room; `None` once released or closed
    fn next_event(&mut self) -> impl Future<Output = Option<RoomEvent>> + Send;

    /// Tear down the channel. Safe to call more than once.
    fn release(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens channels for rooms
pub trait ChannelFactory: Send + Sync + 'static {
    type Channel: RealtimeChannel;

    fn open(&self, room_id: RoomId) -> impl Future<Output = Result<Self::Channel>> + Send;
}

/// How to reach a relay
#[derive(Clone)]
pub enum Transport {
    Tcp(SocketAddr),
    /// In-process relay over duplex streams
    Local(Server),
}

impl Transport {
    pub async fn connect(&self) -> Result<Client> {
        let client = match self {
            Transport::Tcp(addr) => Client::connect(*addr).await?,
            Transport::Local(server) => Client::from_stream(server.connect_local()).await?,
        };
        Ok(client)
    }
}

/// Room store reached through a relay's request/response front
///
/// The connection is re-opened on demand once the relay drops it, so a
/// session that reconnects its channel can also write again.
pub struct RemoteStore {
    transport: Transport,
    // Holding the client keeps its event stream (and the connection) alive
    link: Mutex<Client>,
}

impl RemoteStore {
    pub async fn connect(transport: &Transport) -> Result<Self> {
        let client = transport.connect().await?;
        info!(connection_id = %client.connection_id(), "Store connection open");
        Ok(Self {
            transport: transport.clone(),
            link: Mutex::new(client),
        })
    }

    pub async fn close(&self) {
        self.link.lock().await.disconnect().await;
    }

    /// Current handle, reconnecting first if the connection is gone
    async fn handle(&self) -> Result<ClientHandle> {
        let mut client = self.link.lock().await;
        if !client.handle().is_connected() {
            info!("Store connection lost, reconnecting");
            *client = self.transport.connect().await?;
            info!(connection_id = %client.connection_id(), "Store connection open");
        }
        Ok(client.handle())
    }

    /// Run a request. One retry when the request never left a dead connection.
    async fn call<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: Fn(ClientHandle) -> Fut + Send + Sync,
        Fut: Future<Output = raidroom_net::Result<T>> + Send,
        T: Send,
    {
        match request(self.handle().await?).await {
            Err(raidroom_net::Error::NotConnected) => {
                debug!("Store request hit a closed connection, retrying");
                Ok(request(self.handle().await?).await?)
            }
            result => Ok(result?),
        }
    }
}

impl RoomStoreAdapter for RemoteStore {
    async fn fetch_room(&self, room_id: RoomId) -> Result<Option<Room>> {
        self.call(|handle| async move { handle.fetch_room(room_id).await })
            .await
    }

    async fn replace_plan(&self, room_id: RoomId, plan: Plan) -> Result<()> {
        self.call(|handle| {
            let plan = plan.clone();
            async move { handle.replace_plan(room_id, plan).await }
        })
        .await
    }

    async fn fetch_messages(&self, room_id: RoomId, limit: u32) -> Result<Vec<ChatMessage>> {
        self.call(|handle| async move { handle.fetch_messages(room_id, limit).await })
            .await
    }

    async fn insert_message(&self, message: NewChatMessage) -> Result<()> {
        self.call(|handle| {
            let message = message.clone();
            async move { handle.insert_message(message).await }
        })
        .await
    }

    async fn create_room(&self, host_id: UserId, game: String, plan: Option<Plan>) -> Result<Room> {
        self.call(|handle| {
            let game = game.clone();
            let plan = plan.clone();
            async move { handle.create_room(host_id, game, plan).await }
        })
        .await
    }
}

/// Realtime channel over its own relay connection
pub struct NetChannel {
    room_id: RoomId,
    client: Client,
    released: bool,
}

impl NetChannel {
    pub fn new(room_id: RoomId, client: Client) -> Self {
        Self {
            room_id,
            client,
            released: false,
        }
    }

    fn map_event(&self, event: ChannelEvent) -> Option<RoomEvent> {
        let (room_id, mapped) = match event {
            ChannelEvent::Subscribed { room_id } => (room_id, RoomEvent::Subscribed),
            ChannelEvent::SubscribeRejected { room_id, reason } => {
                (room_id, RoomEvent::Rejected(reason))
            }
            ChannelEvent::PresenceSync { room_id, entries } => {
                (room_id, RoomEvent::PresenceSync(entries))
            }
            ChannelEvent::PresenceJoin {
                room_id,
                key,
                record,
            } => (room_id, RoomEvent::PresenceJoin { key, record }),
            ChannelEvent::PresenceLeave {
                room_id,
                key,
                record,
            } => (room_id, RoomEvent::PresenceLeave { key, record }),
            ChannelEvent::Broadcast {
                room_id,
                event,
                payload,
                from,
            } => (
                room_id,
                RoomEvent::Broadcast {
                    event,
                    payload,
                    from,
                },
            ),
            ChannelEvent::Change { room_id, change } => match change {
                RowChange::RoomUpdated(room) => (room_id, RoomEvent::RoomUpdated(room)),
                RowChange::MessageInserted(msg) => (room_id, RoomEvent::MessageInserted(msg)),
            },
            ChannelEvent::ServerShutdown | ChannelEvent::Disconnected => {
                return Some(RoomEvent::Closed)
            }
        };

        if room_id != self.room_id {
            debug!(room_id = %room_id, "Dropping event for another room");
            return None;
        }
        Some(mapped)
    }
}

impl RealtimeChannel for NetChannel {
    fn connection_id(&self) -> ConnectionId {
        self.client.connection_id()
    }

    async fn subscribe(&mut self) -> Result<()> {
        Ok(self.client.handle().subscribe(self.room_id).await?)
    }

    async fn track(&mut self, record: PresenceRecord) -> Result<()> {
        Ok(self.client.handle().track(self.room_id, record).await?)
    }

    async fn send_broadcast(&mut self, event: &str, payload: serde_json::Value) -> Result<()> {
        Ok(self
            .client
            .handle()
            .broadcast(self.room_id, event, payload)
            .await?)
    }

    async fn next_event(&mut self) -> Option<RoomEvent> {
        if self.released {
            return None;
        }
        loop {
            let event = self.client.next_event().await?;
            if let Some(mapped) = self.map_event(event) {
                return Some(mapped);
            }
        }
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        debug!(room_id = %self.room_id, "Releasing channel");
        let handle = self.client.handle();
        if let Err(e) = handle.unsubscribe(self.room_id).await {
            debug!(error = %e, "Unsubscribe skipped, connection already gone");
        }
        self.client.disconnect().await;
    }
}

/// Opens one relay connection per room channel
#[derive(Clone)]
pub struct NetChannelFactory {
    transport: Transport,
}

impl NetChannelFactory {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

impl ChannelFactory for NetChannelFactory {
    type Channel = NetChannel;

    async fn open(&self, room_id: RoomId) -> Result<NetChannel> {
        let client = self.transport.connect().await?;
        Ok(NetChannel::new(room_id, client))
    }
}
