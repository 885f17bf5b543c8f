//! Room relay server
//!
//! The relay owns the room store and one topic per room. Clients subscribe
//! to topics and exchange presence, broadcast and change-notification
//! events. Store writes are committed and fanned out under the same lock,
//! so every subscriber sees change notifications in commit order.
//!
//! Fan-out never waits on a peer. Each connection has a bounded outbound
//! queue; a peer that lets it fill up is evicted and has to reconnect.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use raidroom_core::{
    ConnectionId, Database, Error as StoreError, PresenceEntry, PresenceRecord, Room, RoomId,
    RoomRepository, Storage,
};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Message, RowChange, StoreOp, StoreReply};

/// Buffer size for in-process duplex connections
const DUPLEX_BUFFER: usize = 64 * 1024;

/// How long a closing connection may take to flush its queue
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Relay settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// 0 picks a random port
    pub port: u16,
    /// Connections silent for longer than this are dropped
    pub liveness_timeout: Duration,
    pub max_peers_per_room: usize,
    /// Frames queued for one connection before it counts as lagging
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: crate::DEFAULT_PORT,
            liveness_timeout: Duration::from_secs(30),
            max_peers_per_room: 32,
            outbound_queue: 1024,
        }
    }
}

/// Outbound side of one connection
#[derive(Clone)]
struct Peer {
    tx: mpsc::Sender<Message>,
    evict: Arc<Notify>,
}

impl Peer {
    /// Queue a frame without waiting. A full queue evicts the peer.
    fn deliver(&self, msg: Message) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.evict.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// One room's subscribers and presence
#[derive(Default)]
struct Topic {
    subscribers: HashMap<ConnectionId, Peer>,
    presence: HashMap<ConnectionId, PresenceRecord>,
}

impl Topic {
    fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .presence
            .iter()
            .map(|(key, record)| PresenceEntry {
                key: *key,
                record: record.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.record.online_at.cmp(&b.record.online_at));
        entries
    }

    fn targets(&self, except: Option<ConnectionId>) -> Vec<Peer> {
        self.subscribers
            .iter()
            .filter(|(id, _)| except != Some(**id))
            .map(|(_, peer)| peer.clone())
            .collect()
    }

    fn deliver_all(&self, msg: &Message) {
        for peer in self.subscribers.values() {
            peer.deliver(msg.clone());
        }
    }
}

/// Server state shared across tasks
#[derive(Default)]
struct ServerState {
    topics: HashMap<RoomId, Topic>,
}

struct Shared {
    state: RwLock<ServerState>,
    /// Held across commit and fan-out to keep notifications in commit order
    store: Mutex<Database>,
    config: ServerConfig,
    shutdown_tx: broadcast::Sender<()>,
}

/// Relay server handle (clones share one relay)
#[derive(Clone)]
pub struct Server {
    addr: Option<SocketAddr>,
    shared: Arc<Shared>,
}

impl Server {
    /// Start a TCP relay on the configured address
    pub async fn start(config: ServerConfig, db: Database) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(config.bind, config.port)).await?;
        let bound_addr = listener.local_addr()?;

        let server = Self::build(config, db, Some(bound_addr));
        info!(addr = %bound_addr, "Server started");

        let shutdown_rx = server.shared.shutdown_tx.subscribe();
        tokio::spawn(accept_loop(listener, server.shared.clone(), shutdown_rx));

        Ok(server)
    }

    /// Relay without a listener; clients attach through [`Server::connect_local`]
    pub fn in_memory(config: ServerConfig, db: Database) -> Self {
        Self::build(config, db, None)
    }

    fn build(config: ServerConfig, db: Database, addr: Option<SocketAddr>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shared = Arc::new(Shared {
            state: RwLock::new(ServerState::default()),
            store: Mutex::new(db),
            config,
            shutdown_tx,
        });
        Self { addr, shared }
    }

    /// Open an in-process connection served by the same handler as TCP peers
    pub fn connect_local(&self) -> DuplexStream {
        let (client_end, server_end) = tokio::io::duplex(DUPLEX_BUFFER);
        tokio::spawn(handle_connection(
            server_end,
            "local".to_string(),
            self.shared.clone(),
        ));
        client_end
    }

    /// Get the server's bound address (None for in-memory relays)
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Current presence snapshot of a room
    pub async fn presence(&self, room_id: RoomId) -> Vec<PresenceEntry> {
        let state = self.shared.state.read().await;
        state
            .topics
            .get(&room_id)
            .map(Topic::snapshot)
            .unwrap_or_default()
    }

    /// Number of connections subscribed to a room
    pub async fn subscriber_count(&self, room_id: RoomId) -> usize {
        let state = self.shared.state.read().await;
        state
            .topics
            .get(&room_id)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    /// Read a room straight from the store
    pub async fn room(&self, room_id: RoomId) -> Result<Option<Room>> {
        let db = self.shared.store.lock().await;
        db.find_room_by_id(room_id)
            .map_err(|e| Error::Store(e.to_string()))
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, "Failed to set TCP_NODELAY");
                        }
                        tokio::spawn(handle_connection(stream, addr.to_string(), shared.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection<S>(stream: S, peer_addr: String, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let connection_id = ConnectionId::new();

    let (tx, rx) = mpsc::channel(shared.config.outbound_queue.max(1));
    let writer_handle = tokio::spawn(writer_task(writer, rx));
    let peer = Peer {
        tx,
        evict: Arc::new(Notify::new()),
    };

    if !peer.deliver(Message::Welcome { connection_id }) {
        return;
    }
    info!(peer = %peer_addr, connection_id = %connection_id, "Peer connected");

    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut rooms: HashSet<RoomId> = HashSet::new();
    let liveness = shared.config.liveness_timeout;

    loop {
        tokio::select! {
            result = tokio::time::timeout(liveness, read_frame(&mut reader)) => {
                match result {
                    Ok(Ok(msg)) => {
                        handle_message(msg, connection_id, &peer, &mut rooms, &shared).await;
                    }
                    Ok(Err(Error::ConnectionClosed)) => {
                        debug!(connection_id = %connection_id, "Connection closed");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(connection_id = %connection_id, error = %e, "Read error");
                        break;
                    }
                    Err(_) => {
                        warn!(connection_id = %connection_id, "Liveness timeout, dropping peer");
                        break;
                    }
                }
            }
            _ = peer.evict.notified() => {
                warn!(connection_id = %connection_id, "Outbound queue full, evicting peer");
                break;
            }
            _ = shutdown_rx.recv() => {
                peer.deliver(Message::ServerShutdown);
                break;
            }
        }
    }

    // Cleanup
    for room_id in rooms {
        leave_room(&shared, room_id, connection_id).await;
    }
    drop(peer);
    let mut writer_handle = writer_handle;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_handle)
        .await
        .is_err()
    {
        writer_handle.abort();
    }

    info!(connection_id = %connection_id, "Peer disconnected");
}

/// Writer task - sends messages to the client
async fn writer_task<S>(mut writer: WriteHalf<S>, mut rx: mpsc::Receiver<Message>)
where
    S: AsyncWrite,
{
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Handle an incoming message
async fn handle_message(
    msg: Message,
    connection_id: ConnectionId,
    peer: &Peer,
    rooms: &mut HashSet<RoomId>,
    shared: &Arc<Shared>,
) {
    match msg {
        Message::Subscribe { room_id } => {
            if rooms.contains(&room_id) {
                peer.deliver(Message::Subscribed { room_id });
                return;
            }
            if join_room(shared, room_id, connection_id, peer).await {
                rooms.insert(room_id);
            }
        }
        Message::Unsubscribe { room_id } => {
            if rooms.remove(&room_id) {
                leave_room(shared, room_id, connection_id).await;
            }
        }
        Message::Track { room_id, record } => {
            if !rooms.contains(&room_id) {
                debug!(connection_id = %connection_id, "Track before subscribe ignored");
                return;
            }
            track(shared, room_id, connection_id, record).await;
        }
        Message::Broadcast {
            room_id,
            event,
            payload,
            from: _,
        } => {
            if !rooms.contains(&room_id) {
                return;
            }
            // Best effort; targets are collected and the lock released first
            let targets = {
                let state = shared.state.read().await;
                match state.topics.get(&room_id) {
                    Some(topic) => topic.targets(Some(connection_id)),
                    None => return,
                }
            };
            let msg = Message::Broadcast {
                room_id,
                event,
                payload,
                from: Some(connection_id),
            };
            for target in targets {
                target.deliver(msg.clone());
            }
        }
        Message::Request { id, op } => {
            let reply = handle_store_op(shared, op).await;
            peer.deliver(Message::Response { id, reply });
        }
        Message::Ping => {
            peer.deliver(Message::Pong);
        }
        _ => {
            debug!(connection_id = %connection_id, "Ignoring unexpected message type");
        }
    }
}

/// Add a connection to a room topic. Returns false when refused.
async fn join_room(
    shared: &Arc<Shared>,
    room_id: RoomId,
    connection_id: ConnectionId,
    peer: &Peer,
) -> bool {
    let mut state = shared.state.write().await;
    let topic = state.topics.entry(room_id).or_default();

    if topic.subscribers.len() >= shared.config.max_peers_per_room {
        warn!(room_id = %room_id, "Room full, refusing subscription");
        peer.deliver(Message::SubscribeRejected {
            room_id,
            reason: "Room full".into(),
        });
        if topic.subscribers.is_empty() {
            state.topics.remove(&room_id);
        }
        return false;
    }

    topic.subscribers.insert(connection_id, peer.clone());
    let entries = topic.snapshot();
    peer.deliver(Message::Subscribed { room_id });
    peer.deliver(Message::PresenceSync { room_id, entries });

    info!(room_id = %room_id, connection_id = %connection_id, "Subscribed");
    true
}

/// Publish or replace a connection's presence record
async fn track(
    shared: &Arc<Shared>,
    room_id: RoomId,
    connection_id: ConnectionId,
    mut record: PresenceRecord,
) {
    // Write lock held through fan-out so every peer sees syncs in order
    let mut state = shared.state.write().await;
    let Some(topic) = state.topics.get_mut(&room_id) else {
        return;
    };

    // A re-track keeps the connection's original join time
    let previous = topic.presence.get(&connection_id).map(|r| r.online_at);
    if let Some(online_at) = previous {
        record.online_at = online_at;
    }
    let is_new = previous.is_none();
    topic.presence.insert(connection_id, record.clone());

    debug!(room_id = %room_id, connection_id = %connection_id, is_new, "Presence tracked");

    if is_new {
        topic.deliver_all(&Message::PresenceJoin {
            room_id,
            key: connection_id,
            record,
        });
    }
    topic.deliver_all(&Message::PresenceSync {
        room_id,
        entries: topic.snapshot(),
    });
}

/// Remove a connection from a room and announce its departure
async fn leave_room(shared: &Arc<Shared>, room_id: RoomId, connection_id: ConnectionId) {
    let mut state = shared.state.write().await;
    let Some(topic) = state.topics.get_mut(&room_id) else {
        return;
    };

    topic.subscribers.remove(&connection_id);
    if let Some(record) = topic.presence.remove(&connection_id) {
        topic.deliver_all(&Message::PresenceLeave {
            room_id,
            key: connection_id,
            record,
        });
        topic.deliver_all(&Message::PresenceSync {
            room_id,
            entries: topic.snapshot(),
        });
    }

    if topic.subscribers.is_empty() {
        state.topics.remove(&room_id);
    }
    info!(room_id = %room_id, connection_id = %connection_id, "Left room");
}

/// Execute a store operation and fan out the resulting change, if any
async fn handle_store_op(shared: &Arc<Shared>, op: StoreOp) -> StoreReply {
    let db = shared.store.lock().await;
    let (reply, change) = apply_store_op(&*db, op);

    if let Some((room_id, change)) = change {
        let state = shared.state.read().await;
        if let Some(topic) = state.topics.get(&room_id) {
            topic.deliver_all(&Message::Change { room_id, change });
        }
    }

    drop(db);
    reply
}

/// Run one store request. Returns the reply and the change to announce.
fn apply_store_op<S: Storage>(store: &S, op: StoreOp) -> (StoreReply, Option<(RoomId, RowChange)>) {
    match op {
        StoreOp::FetchRoom { room_id } => match store.find_room_by_id(room_id) {
            Ok(Some(room)) => (StoreReply::Room { room }, None),
            Ok(None) => (not_found(room_id), None),
            Err(e) => (failed(e), None),
        },
        StoreOp::ReplacePlan { room_id, plan } => {
            let result = store
                .replace_plan(room_id, &plan)
                .and_then(|_| store.find_room_by_id(room_id));
            match result {
                Ok(Some(room)) => (StoreReply::Ok, Some((room_id, RowChange::RoomUpdated(room)))),
                Ok(None) | Err(StoreError::NotFound(_)) => (not_found(room_id), None),
                Err(e) => (failed(e), None),
            }
        }
        StoreOp::FetchMessages { room_id, limit } => {
            match store.list_recent_messages(room_id, limit) {
                Ok(messages) => (StoreReply::Messages { messages }, None),
                Err(e) => (failed(e), None),
            }
        }
        StoreOp::InsertMessage { message } => {
            let room_id = message.room_id;
            match store.insert_message(message) {
                Ok(stored) => (
                    StoreReply::Ok,
                    Some((room_id, RowChange::MessageInserted(stored))),
                ),
                Err(e) => (failed(e), None),
            }
        }
        StoreOp::CreateRoom {
            host_id,
            game,
            plan,
        } => {
            let room = Room::new(host_id, game, plan);
            match store.create_room(&room) {
                Ok(()) => {
                    info!(room_id = %room.id, "Room created");
                    (StoreReply::Room { room }, None)
                }
                Err(e) => (failed(e), None),
            }
        }
    }
}

fn not_found(room_id: RoomId) -> StoreReply {
    StoreReply::NotFound {
        what: format!("room {}", room_id),
    }
}

fn failed(e: StoreError) -> StoreReply {
    warn!(error = %e, "Store operation failed");
    StoreReply::Failed {
        error: e.to_string(),
    }
}
