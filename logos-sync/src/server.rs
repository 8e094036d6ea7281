//! Relay server: stores ciphertext, checks capabilities, fans out events.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── uncommitted UpdateRecords (ciphertext)
//!            ├── Room (room id) ──┼── latest CommitRecord
//! Client B ──┘        │           └── pinned session identity / owner address
//!                     │
//!               BroadcastGroup ──► Client A, Client B, ... (minus origin)
//! ```
//!
//! The relay never holds a room key. A room is pinned to the session
//! identity of its first member; later members must present a token signed
//! by the same identity, which they can only produce if they hold the key.
//! The first owner handshake pins the owner address that commit and
//! terminate calls are checked against.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{Capability, CapabilityToken};
use crate::broadcast::{BroadcastGroup, RoomBroadcast};
use crate::error::AuthError;
use crate::protocol::{
    unix_now, CommitRecord, Frame, HandshakePayload, MemberRole, Reply, ReplyData, Request,
    RoomMember, ServerEvent, UpdateId, UpdateRecord, STATUS_BAD_REQUEST, STATUS_CONFLICT,
    STATUS_FORBIDDEN, STATUS_NOT_FOUND, STATUS_UNAUTHORIZED,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub stored_updates: u64,
    pub commits: u64,
}

struct Room {
    session_identity: String,
    owner_address: Option<String>,
    room_info: Option<Vec<u8>>,
    next_update_id: u64,
    uncommitted: BTreeMap<UpdateId, Vec<u8>>,
    latest_commit: Option<CommitRecord>,
    broadcast: Arc<BroadcastGroup>,
}

impl Room {
    fn new(session_identity: String, broadcast_capacity: usize) -> Self {
        Self {
            session_identity,
            owner_address: None,
            room_info: None,
            next_update_id: 1,
            uncommitted: BTreeMap::new(),
            latest_commit: None,
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }

    fn store_update(&mut self, data: Vec<u8>) -> UpdateRecord {
        let id = UpdateId(self.next_update_id);
        self.next_update_id += 1;
        self.uncommitted.insert(id, data.clone());
        UpdateRecord { id, data }
    }

    fn check_owner(
        &self,
        token: &CapabilityToken,
        server_identity: &str,
        room_id: &str,
    ) -> Result<(), Reply> {
        token
            .verify(server_identity, room_id, Capability::Own, unix_now())
            .map_err(|e| Reply::error(STATUS_UNAUTHORIZED, e.to_string()))?;
        match &self.owner_address {
            Some(owner) if *owner == token.claims.issuer => Ok(()),
            _ => Err(Reply::error(STATUS_FORBIDDEN, "caller is not the room owner")),
        }
    }
}

/// What a connection knows after a successful handshake.
struct Joined {
    room_id: String,
    member: RoomMember,
}

struct Shared {
    config: ServerConfig,
    server_identity: String,
    rooms: RwLock<HashMap<String, Room>>,
    stats: RwLock<ServerStats>,
}

/// The relay server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a relay with a fresh random identity.
    pub fn new(config: ServerConfig) -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::with_identity(config, SigningKey::from_bytes(&seed))
    }

    /// Create a relay with a fixed identity (stable across restarts).
    pub fn with_identity(config: ServerConfig, identity: SigningKey) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                server_identity: hex::encode(identity.verifying_key().to_bytes()),
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Hex public key presented in every challenge.
    pub fn server_identity(&self) -> &str {
        &self.shared.server_identity
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!(
            "Relay listening on {} as {}",
            listener.local_addr()?,
            self.shared.server_identity
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Uncommitted update count for a room (`None` if the room is unknown).
    pub async fn uncommitted_count(&self, room_id: &str) -> Option<usize> {
        let rooms = self.shared.rooms.read().await;
        rooms.get(room_id).map(|room| room.uncommitted.len())
    }

    pub async fn latest_commit(&self, room_id: &str) -> Option<CommitRecord> {
        let rooms = self.shared.rooms.read().await;
        rooms.get(room_id).and_then(|room| room.latest_commit.clone())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let challenge = Frame::Event(ServerEvent::Challenge {
        server_identity: shared.server_identity.clone(),
    })
    .encode()?;
    ws_sender.send(Message::Binary(challenge.into())).await?;

    let mut joined: Option<Joined> = None;
    let mut broadcast_rx: Option<broadcast::Receiver<Arc<RoomBroadcast>>> = None;

    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = shared.stats.write().await;
                            s.total_requests += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let (id, call) = match Frame::decode(&data) {
                            Ok(Frame::Request { id, call }) => (id, call),
                            Ok(_) => {
                                log::warn!("Ignoring non-request frame from {addr}");
                                continue;
                            }
                            Err(e) => {
                                log::warn!("Failed to decode frame from {addr}: {e}");
                                continue;
                            }
                        };

                        let mut announce_join = false;
                        let reply = match call {
                            Request::Handshake(payload) if joined.is_none() => {
                                match handshake(&shared, payload).await {
                                    Ok((session, rx)) => {
                                        let room_info = room_info(&shared, &session.room_id).await;
                                        joined = Some(session);
                                        broadcast_rx = Some(rx);
                                        announce_join = true;
                                        Some(Reply::ok(ReplyData::RoomInfo(room_info)))
                                    }
                                    Err(reply) => Some(reply),
                                }
                            }
                            Request::Handshake(_) => {
                                Some(Reply::error(STATUS_BAD_REQUEST, "already joined"))
                            }
                            call => match &joined {
                                Some(session) => handle_call(&shared, session, call).await,
                                None if call.is_acknowledged() => {
                                    Some(Reply::error(STATUS_UNAUTHORIZED, "handshake required"))
                                }
                                None => None,
                            },
                        };

                        if let Some(reply) = reply {
                            let frame = Frame::Response { id, reply }.encode()?;
                            ws_sender.send(Message::Binary(frame.into())).await?;
                        }

                        // Announce the join only after the handshake reply went out.
                        if let (true, Some(session)) = (announce_join, &joined) {
                            announce(&shared, &session.room_id).await;
                            log::info!(
                                "{} ({}) joined room {}",
                                session.member.name,
                                session.member.peer_id,
                                session.room_id
                            );
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                },

                msg = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match msg {
                    Ok(message) => {
                        let me = joined.as_ref().map(|s| s.member.peer_id);
                        if me.is_some_and(|id| message.is_for(&id)) {
                            ws_sender.send(Message::Binary(message.frame.clone().into())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {addr} lagged by {n} frames");
                        if let Some(session) = &joined {
                            record_lag(&shared, &session.room_id, n).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Room removed (terminated).
                        broadcast_rx = None;
                    }
                },
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    // Cleanup: leave the room and tell the others
    if let Some(session) = joined {
        let rooms = shared.rooms.read().await;
        if let Some(room) = rooms.get(&session.room_id) {
            room.broadcast.remove_member(&session.member.peer_id).await;
            let _ = room
                .broadcast
                .broadcast_event(None, ServerEvent::MembershipChanged);
            log::info!("{} left room {}", session.member.name, session.room_id);
        }
    }
    shared.stats.write().await.active_connections -= 1;

    result
}

/// Verify a handshake and join the room.
async fn handshake(
    shared: &Shared,
    payload: HandshakePayload,
) -> Result<(Joined, broadcast::Receiver<Arc<RoomBroadcast>>), Reply> {
    let server_identity = &shared.server_identity;
    let room_id = payload.room_id.clone();
    if room_id.is_empty() {
        return Err(Reply::error(STATUS_BAD_REQUEST, "room id is required"));
    }

    let unauthorized = |e: AuthError| Reply::error(STATUS_UNAUTHORIZED, e.to_string());
    payload
        .token
        .verify(server_identity, &room_id, Capability::Collaborate, unix_now())
        .map_err(unauthorized)?;
    if payload.token.claims.issuer != payload.session_identity {
        return Err(Reply::error(
            STATUS_UNAUTHORIZED,
            "token not signed by the presented session identity",
        ));
    }

    let owner_address = match (&payload.owner_token, &payload.owner_address) {
        (Some(token), Some(address)) => {
            token
                .verify(server_identity, &room_id, Capability::Own, unix_now())
                .map_err(unauthorized)?;
            if token.claims.issuer != *address {
                return Err(Reply::error(
                    STATUS_UNAUTHORIZED,
                    "owner token not signed by the owner address",
                ));
            }
            Some(address.clone())
        }
        (None, None) => None,
        _ => return Err(Reply::error(STATUS_BAD_REQUEST, "incomplete owner credentials")),
    };
    if payload.member.role == MemberRole::Owner && owner_address.is_none() {
        return Err(Reply::error(STATUS_FORBIDDEN, "owner role requires an owner token"));
    }

    let mut rooms = shared.rooms.write().await;
    let room = rooms.entry(room_id.clone()).or_insert_with(|| {
        log::info!("Room {room_id} created");
        Room::new(
            payload.session_identity.clone(),
            shared.config.broadcast_capacity,
        )
    });

    if room.session_identity != payload.session_identity {
        return Err(Reply::error(STATUS_FORBIDDEN, "room key mismatch"));
    }
    if let Some(address) = &owner_address {
        match &room.owner_address {
            Some(pinned) if pinned != address => {
                return Err(Reply::error(STATUS_FORBIDDEN, "room already has a different owner"));
            }
            Some(_) => {}
            None => {
                log::info!("Room {room_id} owned by {address}");
                room.owner_address = Some(address.clone());
            }
        }
    }
    if room.broadcast.member_count().await >= shared.config.max_peers_per_room {
        return Err(Reply::error(STATUS_CONFLICT, "room is full"));
    }
    if room.room_info.is_none() {
        room.room_info = payload.room_info;
    }

    let rx = room.broadcast.add_member(payload.member.clone()).await;
    let active_rooms = rooms.len();
    drop(rooms);
    shared.stats.write().await.active_rooms = active_rooms;

    Ok((
        Joined {
            room_id,
            member: payload.member,
        },
        rx,
    ))
}

async fn room_info(shared: &Shared, room_id: &str) -> Option<Vec<u8>> {
    let rooms = shared.rooms.read().await;
    rooms.get(room_id).and_then(|room| room.room_info.clone())
}

async fn announce(shared: &Shared, room_id: &str) {
    let rooms = shared.rooms.read().await;
    if let Some(room) = rooms.get(room_id) {
        let _ = room
            .broadcast
            .broadcast_event(None, ServerEvent::MembershipChanged);
    }
}

async fn record_lag(shared: &Shared, room_id: &str, n: u64) {
    let rooms = shared.rooms.read().await;
    if let Some(room) = rooms.get(room_id) {
        room.broadcast.record_dropped(n);
    }
}

/// Serve one call from a joined member. `None` for unacknowledged calls.
async fn handle_call(shared: &Shared, session: &Joined, call: Request) -> Option<Reply> {
    let name = call.name();
    let mut rooms = shared.rooms.write().await;
    let Some(room) = rooms.get_mut(&session.room_id) else {
        return call
            .is_acknowledged()
            .then(|| Reply::error(STATUS_NOT_FOUND, "room no longer exists"));
    };
    let peer_id = session.member.peer_id;

    let reply = match call {
        Request::Handshake(_) => Reply::error(STATUS_BAD_REQUEST, "already joined"),

        Request::SendUpdate { data } => {
            let record = room.store_update(data);
            let id = record.id;
            if let Err(e) = room
                .broadcast
                .broadcast_event(Some(peer_id), ServerEvent::Update(record))
            {
                log::error!("Failed to broadcast update {id}: {e}");
            }
            drop(rooms);
            shared.stats.write().await.stored_updates += 1;
            log::trace!("Stored update {id} in room {}", session.room_id);
            return Some(Reply::ok(ReplyData::UpdateId(id)));
        }

        Request::CommitUpdates {
            update_ids,
            content_id,
            owner_token,
        } => {
            if let Err(reply) =
                room.check_owner(&owner_token, &shared.server_identity, &session.room_id)
            {
                return Some(reply);
            }
            for id in &update_ids {
                room.uncommitted.remove(id);
            }
            log::info!(
                "Room {} committed {} updates as {content_id}",
                session.room_id,
                update_ids.len()
            );
            room.latest_commit = Some(CommitRecord {
                content_id,
                update_ids,
                created_at: unix_now(),
            });
            drop(rooms);
            shared.stats.write().await.commits += 1;
            return Some(Reply::ok(ReplyData::None));
        }

        Request::FetchLatestCommit => Reply::ok(ReplyData::Commit(room.latest_commit.clone())),

        Request::FetchUncommittedChanges => Reply::ok(ReplyData::Updates(
            room.uncommitted
                .iter()
                .map(|(id, data)| UpdateRecord {
                    id: *id,
                    data: data.clone(),
                })
                .collect(),
        )),

        Request::BroadcastAwareness { data } => {
            let _ = room
                .broadcast
                .broadcast_event(Some(peer_id), ServerEvent::Awareness { peer_id, data });
            return None;
        }

        Request::FetchPeers => Reply::ok(ReplyData::Peers(room.broadcast.members().await)),

        Request::TerminateSession { owner_token } => {
            if let Err(reply) =
                room.check_owner(&owner_token, &shared.server_identity, &session.room_id)
            {
                return Some(reply);
            }
            let _ = room
                .broadcast
                .broadcast_event(Some(peer_id), ServerEvent::SessionTerminated);
            rooms.remove(&session.room_id);
            let active_rooms = rooms.len();
            drop(rooms);
            shared.stats.write().await.active_rooms = active_rooms;
            log::info!("Room {} terminated by its owner", session.room_id);
            return Some(Reply::ok(ReplyData::None));
        }
    };

    log::trace!("Served {name} for {}", session.member.peer_id);
    Some(reply)
}
