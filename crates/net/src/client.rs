//! Client connection to a room relay
//!
//! A [`Client`] owns one connection. Events arrive through
//! [`Client::next_event`]; everything that sends (subscribe, track,
//! broadcast, store requests) goes through a cloneable [`ClientHandle`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use raidroom_core::{
    ChatMessage, ConnectionId, NewChatMessage, Plan, PresenceEntry, PresenceRecord, Room, RoomId,
    UserId,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Message, RowChange, StoreOp, StoreReply};

/// Keepalive ping interval (well under the relay's liveness timeout)
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// How long to wait for the relay's welcome frame
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Event received from the relay
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Subscribed {
        room_id: RoomId,
    },
    SubscribeRejected {
        room_id: RoomId,
        reason: String,
    },
    PresenceSync {
        room_id: RoomId,
        entries: Vec<PresenceEntry>,
    },
    PresenceJoin {
        room_id: RoomId,
        key: ConnectionId,
        record: PresenceRecord,
    },
    PresenceLeave {
        room_id: RoomId,
        key: ConnectionId,
        record: PresenceRecord,
    },
    Broadcast {
        room_id: RoomId,
        event: String,
        payload: serde_json::Value,
        from: Option<ConnectionId>,
    },
    Change {
        room_id: RoomId,
        change: RowChange,
    },
    ServerShutdown,
    /// Connection lost
    Disconnected,
}

enum ClientCommand {
    Send(Message),
    Disconnect,
}

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<StoreReply>>>>;

/// Cloneable sending side of a connection
#[derive(Clone)]
pub struct ClientHandle {
    connection_id: ConnectionId,
    cmd_tx: mpsc::Sender<ClientCommand>,
    pending: PendingRequests,
    next_request: Arc<AtomicU64>,
    /// Cleared by the connection task on its way out
    connected: Arc<AtomicBool>,
}

/// Client handle for network operations
pub struct Client {
    handle: ClientHandle,
    event_rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Client {
    /// Connect to a relay over TCP
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        info!(addr = %addr, "Connecting to server");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream).await
    }

    /// Run the client protocol over an already-open stream
    pub async fn from_stream<S>(stream: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);

        let connection_id = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
            .await
        {
            Ok(Ok(Message::Welcome { connection_id })) => connection_id,
            Ok(Ok(other)) => {
                return Err(Error::Protocol(format!(
                    "Expected Welcome, got {:?}",
                    other
                )))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::HandshakeTimeout),
        };
        debug!(connection_id = %connection_id, "Handshake complete");

        let connected = Arc::new(AtomicBool::new(true));
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        tokio::spawn(connection_task(
            reader,
            writer,
            connected.clone(),
            pending.clone(),
            event_tx,
            cmd_rx,
        ));

        Ok(Client {
            handle: ClientHandle {
                connection_id,
                cmd_tx,
                pending,
                next_request: Arc::new(AtomicU64::new(1)),
                connected,
            },
            event_rx,
        })
    }

    /// Sending side of this connection
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.handle.connection_id
    }

    /// Get the next relay event; `None` once the connection task is gone
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.event_rx.recv().await
    }

    /// Non-blocking poll for a relay event
    pub fn try_next_event(&mut self) -> Option<ChannelEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) {
        self.handle.disconnect().await;
    }
}

impl ClientHandle {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// False once the connection task has stopped
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Send(msg))
            .await
            .map_err(|_| Error::NotConnected)
    }

    pub async fn subscribe(&self, room_id: RoomId) -> Result<()> {
        self.send(Message::Subscribe { room_id }).await
    }

    /// Leave a room; the relay announces the departure right away
    pub async fn unsubscribe(&self, room_id: RoomId) -> Result<()> {
        self.send(Message::Unsubscribe { room_id }).await
    }

    /// Publish (or replace) this connection's presence in a room
    pub async fn track(&self, room_id: RoomId, record: PresenceRecord) -> Result<()> {
        self.send(Message::Track { room_id, record }).await
    }

    /// Fire-and-forget event to the other subscribers of a room
    pub async fn broadcast(
        &self,
        room_id: RoomId,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.send(Message::Broadcast {
            room_id,
            event: event.to_string(),
            payload,
            from: None,
        })
        .await
    }

    /// Disconnect from the server (idempotent)
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    /// Issue a store request and wait for its response
    pub async fn request(&self, op: StoreOp) -> Result<StoreReply> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| Error::NotConnected)?
            .insert(id, tx);

        // Checked after registering: a connection that stops from here on
        // clears `pending`, which fails this request instead of leaving it hanging
        if !self.is_connected() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(Error::NotConnected);
        }

        if let Err(e) = self.send(Message::Request { id, op }).await {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(e);
        }

        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Point read of a room; `None` when it does not exist
    pub async fn fetch_room(&self, room_id: RoomId) -> Result<Option<Room>> {
        match self.request(StoreOp::FetchRoom { room_id }).await? {
            StoreReply::Room { room } => Ok(Some(room)),
            StoreReply::NotFound { .. } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Whole-document overwrite of a room's plan
    pub async fn replace_plan(&self, room_id: RoomId, plan: Plan) -> Result<()> {
        match self.request(StoreOp::ReplacePlan { room_id, plan }).await? {
            StoreReply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Newest `limit` messages, oldest first
    pub async fn fetch_messages(&self, room_id: RoomId, limit: u32) -> Result<Vec<ChatMessage>> {
        match self
            .request(StoreOp::FetchMessages { room_id, limit })
            .await?
        {
            StoreReply::Messages { messages } => Ok(messages),
            other => Err(unexpected(other)),
        }
    }

    /// Append a chat message. The stored row comes back as a change notification.
    pub async fn insert_message(&self, message: NewChatMessage) -> Result<()> {
        match self.request(StoreOp::InsertMessage { message }).await? {
            StoreReply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_room(
        &self,
        host_id: UserId,
        game: String,
        plan: Option<Plan>,
    ) -> Result<Room> {
        match self
            .request(StoreOp::CreateRoom {
                host_id,
                game,
                plan,
            })
            .await?
        {
            StoreReply::Room { room } => Ok(room),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: StoreReply) -> Error {
    match reply {
        StoreReply::NotFound { what } => Error::NotFound(what),
        StoreReply::Failed { error } => Error::Store(error),
        other => Error::Protocol(format!("Unexpected store reply: {:?}", other)),
    }
}

/// Main connection task
async fn connection_task<S>(
    mut reader: ReadHalf<S>,
    mut writer: WriteHalf<S>,
    connected: Arc<AtomicBool>,
    pending: PendingRequests,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Incoming message from server
            result = read_frame(&mut reader) => {
                match result {
                    Ok(msg) => {
                        if !handle_server_message(msg, &pending, &event_tx) {
                            break;
                        }
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!("Server closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            // Outgoing command
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send(msg)) => {
                        if let Err(e) = write_frame(&mut writer, &msg).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write_frame(&mut writer, &Message::Ping).await {
                    warn!(error = %e, "Ping failed");
                    break;
                }
            }
        }
    }

    // Cleanup
    connected.store(false, Ordering::SeqCst);
    if let Ok(mut pending) = pending.lock() {
        // Dropping the senders fails every in-flight request
        pending.clear();
    }
    let _ = event_tx.send(ChannelEvent::Disconnected);
    info!("Disconnected from server");
}

/// Route a relay message. Returns false when the connection should end.
fn handle_server_message(
    msg: Message,
    pending: &PendingRequests,
    event_tx: &mpsc::UnboundedSender<ChannelEvent>,
) -> bool {
    let event = match msg {
        Message::Response { id, reply } => {
            let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => debug!(id, "Response for unknown request"),
            }
            return true;
        }
        Message::Pong => {
            debug!("Received pong");
            return true;
        }
        Message::Subscribed { room_id } => ChannelEvent::Subscribed { room_id },
        Message::SubscribeRejected { room_id, reason } => {
            ChannelEvent::SubscribeRejected { room_id, reason }
        }
        Message::PresenceSync { room_id, entries } => ChannelEvent::PresenceSync { room_id, entries },
        Message::PresenceJoin {
            room_id,
            key,
            record,
        } => ChannelEvent::PresenceJoin {
            room_id,
            key,
            record,
        },
        Message::PresenceLeave {
            room_id,
            key,
            record,
        } => ChannelEvent::PresenceLeave {
            room_id,
            key,
            record,
        },
        Message::Broadcast {
            room_id,
            event,
            payload,
            from,
        } => ChannelEvent::Broadcast {
            room_id,
            event,
            payload,
            from,
        },
        Message::Change { room_id, change } => ChannelEvent::Change { room_id, change },
        Message::ServerShutdown => {
            let _ = event_tx.send(ChannelEvent::ServerShutdown);
            return false;
        }
        _ => {
            debug!("Ignoring unexpected message");
            return true;
        }
    };

    // Receiver gone means nobody is listening any more
    event_tx.send(event).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Server, ServerConfig};
    use raidroom_core::{Database, Identity};

    async fn next(client: &mut Client) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(2), client.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    fn local_server() -> Server {
        Server::in_memory(ServerConfig::default(), Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_client_connect_tcp() {
        let config = ServerConfig {
            bind: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 0,
            ..ServerConfig::default()
        };
        let server = Server::start(config, Database::open_in_memory().unwrap())
            .await
            .unwrap();
        let room_id = RoomId::new();

        let mut client = Client::connect(server.addr().unwrap()).await.unwrap();
        client.handle().subscribe(room_id).await.unwrap();

        assert!(matches!(next(&mut client).await, ChannelEvent::Subscribed { .. }));

        client.disconnect().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_store_requests_and_change_feed() {
        let server = local_server();
        let mut client = Client::from_stream(server.connect_local()).await.unwrap();
        let handle = client.handle();
        let host = UserId::new();

        let room = handle
            .create_room(host, "Warframe".into(), None)
            .await
            .unwrap();
        assert!(handle.fetch_room(room.id).await.unwrap().is_some());
        assert!(handle.fetch_room(RoomId::new()).await.unwrap().is_none());

        handle.subscribe(room.id).await.unwrap();
        assert!(matches!(next(&mut client).await, ChannelEvent::Subscribed { .. }));
        assert!(matches!(next(&mut client).await, ChannelEvent::PresenceSync { .. }));

        handle
            .insert_message(NewChatMessage::chat(
                room.id,
                host,
                "tenno".into(),
                "ready".into(),
            ))
            .await
            .unwrap();

        // The writer hears about its own insert through the change feed
        match next(&mut client).await {
            ChannelEvent::Change {
                change: RowChange::MessageInserted(msg),
                ..
            } => assert_eq!(msg.content, "ready"),
            other => panic!("unexpected {:?}", other),
        }

        let backfill = handle.fetch_messages(room.id, 50).await.unwrap();
        assert_eq!(backfill.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_plan_on_missing_room_is_not_found() {
        let server = local_server();
        let client = Client::from_stream(server.connect_local()).await.unwrap();
        let plan = Plan {
            title: "t".into(),
            game: "g".into(),
            raid: "r".into(),
            vibe: "v".into(),
            squad_size: 3,
            phases: Vec::new(),
        };

        let result = client.handle().replace_plan(RoomId::new(), plan).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let server = local_server();
        let room_id = RoomId::new();
        let mut a = Client::from_stream(server.connect_local()).await.unwrap();
        let mut b = Client::from_stream(server.connect_local()).await.unwrap();

        for client in [&mut a, &mut b] {
            client.handle().subscribe(room_id).await.unwrap();
            next(client).await;
            next(client).await;
        }

        a.handle()
            .broadcast(room_id, "wave", serde_json::json!({ "hi": true }))
            .await
            .unwrap();

        match next(&mut b).await {
            ChannelEvent::Broadcast { event, from, .. } => {
                assert_eq!(event, "wave");
                assert_eq!(from, Some(a.connection_id()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(a.try_next_event().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_announces_leave() {
        let server = local_server();
        let room_id = RoomId::new();
        let mut a = Client::from_stream(server.connect_local()).await.unwrap();
        let mut b = Client::from_stream(server.connect_local()).await.unwrap();

        for client in [&mut a, &mut b] {
            client.handle().subscribe(room_id).await.unwrap();
            next(client).await;
            next(client).await;
        }

        let identity = Identity::new(UserId::new(), "ana");
        a.handle()
            .track(room_id, identity.presence_record())
            .await
            .unwrap();
        assert!(matches!(next(&mut b).await, ChannelEvent::PresenceJoin { .. }));
        assert!(matches!(next(&mut b).await, ChannelEvent::PresenceSync { .. }));

        a.disconnect().await;
        while !matches!(next(&mut a).await, ChannelEvent::Disconnected) {}
        assert!(!a.handle().is_connected());
        assert!(matches!(
            a.handle().fetch_room(room_id).await,
            Err(Error::NotConnected)
        ));

        match next(&mut b).await {
            ChannelEvent::PresenceLeave { key, .. } => assert_eq!(key, a.connection_id()),
            other => panic!("unexpected {:?}", other),
        }
        match next(&mut b).await {
            ChannelEvent::PresenceSync { entries, .. } => assert!(entries.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
