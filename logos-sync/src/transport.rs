//! WebSocket transport to the relay.
//!
//! Provides:
//! - Connection lifecycle with a signed-capability handshake
//! - Acknowledged RPCs correlated by request id
//! - Fire-and-forget awareness broadcast
//! - Roster refetch whenever the relay announces a membership change
//!
//! ```text
//! connect ──► Challenge{server_identity} ──► Handshake{token,..} ──► Reply
//!                                                                      │
//!             writer task ◄── outgoing channel ◄── request()/broadcast │
//!             reader task ──► pending[id] (replies)                    │
//!                         └─► TransportEvent (update/awareness/roster) ┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::auth::{OwnerCapability, SessionIdentity, TokenCache};
use crate::awareness::AwarenessSink;
use crate::commit::CommitRegistrar;
use crate::config::SyncConfig;
use crate::crypto::{self, RoomKey};
use crate::error::{CommitError, ProtocolError, SyncError};
use crate::protocol::{
    unix_now, CommitRecord, ContentId, Frame, HandshakePayload, MemberRole, Reply, ReplyData,
    Request, RoomMember, ServerEvent, UpdateId, UpdateRecord,
};

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events pushed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer's update (ciphertext)
    RemoteUpdate(UpdateRecord),
    /// A peer's awareness payload (ciphertext)
    Awareness { peer_id: Uuid, data: Vec<u8> },
    /// Fresh roster after a membership change
    Roster(Vec<RoomMember>),
    SessionTerminated,
    /// The socket closed without `disconnect()` being called
    Disconnected,
}

/// Room metadata stored encrypted on the relay by the room's creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub created_by: String,
    pub created_at: u64,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// One live websocket.
struct Link {
    outgoing: mpsc::Sender<Vec<u8>>,
    server_identity: String,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct TransportInner {
    config: SyncConfig,
    room_id: String,
    room_key: RoomKey,
    identity: SessionIdentity,
    member: RoomMember,
    state: Mutex<ConnectionState>,
    link: Mutex<Option<Link>>,
    pending: PendingReplies,
    next_id: AtomicU64,
    tokens: Mutex<TokenCache>,
    room_info: Mutex<Option<Vec<u8>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed(err: tungstenite::Error) -> SyncError {
    SyncError::Connection(err.to_string())
}

/// Client side of one room connection.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<TransportInner>,
}

impl TransportClient {
    /// Create a client for `room_id`. Does not connect.
    pub fn new(
        config: SyncConfig,
        room_id: impl Into<String>,
        room_key: RoomKey,
        role: MemberRole,
    ) -> Result<Self, SyncError> {
        let identity = SessionIdentity::from_room_key(&room_key)?;
        let member = RoomMember::new(config.display_name.clone(), role);
        let tokens = TokenCache::new(config.token_ttl, config.token_refresh_buffer);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));

        Ok(Self {
            inner: Arc::new(TransportInner {
                config,
                room_id: room_id.into(),
                room_key,
                identity,
                member,
                state: Mutex::new(ConnectionState::Disconnected),
                link: Mutex::new(None),
                pending: Arc::new(Mutex::new(HashMap::new())),
                next_id: AtomicU64::new(1),
                tokens: Mutex::new(tokens),
                room_info: Mutex::new(None),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
            }),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        lock(&self.inner.event_rx).take()
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    /// This session's roster entry.
    pub fn member(&self) -> &RoomMember {
        &self.inner.member
    }

    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Identity the relay presented in its challenge, while connected.
    pub fn server_identity(&self) -> Option<String> {
        lock(&self.inner.link)
            .as_ref()
            .map(|link| link.server_identity.clone())
    }

    /// Open the socket and perform the handshake.
    ///
    /// Any previous connection is closed first. Owner sessions pass their
    /// credential so the relay can pin the owner address. The whole exchange
    /// is bounded by the configured connect timeout.
    pub async fn connect(&self, owner: Option<&OwnerCapability>) -> Result<(), SyncError> {
        self.close_link();
        self.set_state(ConnectionState::Connecting);

        let timeout = self.inner.config.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.open(owner)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Connection(format!(
                "handshake timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        let result = result.and_then(|link| {
            // Publish under the link lock; the reader's cleanup takes it too.
            let mut slot = lock(&self.inner.link);
            if link.reader.is_finished() {
                return Err(SyncError::Connection(
                    "connection closed right after handshake".to_string(),
                ));
            }
            *slot = Some(link);
            self.set_state(ConnectionState::Connected);
            Ok(())
        });

        match result {
            Ok(()) => {
                log::info!(
                    "Connected to room {} as {} ({})",
                    self.inner.room_id,
                    self.inner.member.name,
                    self.inner.member.peer_id
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                log::warn!("Connect to room {} failed: {e}", self.inner.room_id);
                Err(e)
            }
        }
    }

    async fn open(&self, owner: Option<&OwnerCapability>) -> Result<Link, SyncError> {
        let url = self.inner.config.room_url(&self.inner.room_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(closed)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let server_identity = match next_frame(&mut ws_reader, "handshake").await? {
            Frame::Event(ServerEvent::Challenge { server_identity }) => server_identity,
            _ => return Err(ProtocolError::UnexpectedFrame("handshake").into()),
        };
        log::debug!("Relay identity {server_identity}");

        let payload = self.handshake_payload(&server_identity, owner)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Request {
            id,
            call: Request::Handshake(payload),
        }
        .encode()?;
        ws_writer
            .send(Message::Binary(frame.into()))
            .await
            .map_err(closed)?;

        let reply = loop {
            match next_frame(&mut ws_reader, "handshake").await? {
                Frame::Response { id: reply_id, reply } if reply_id == id => break reply,
                Frame::Event(event) => log::trace!("Skipping {event:?} before handshake reply"),
                _ => return Err(ProtocolError::UnexpectedFrame("handshake").into()),
            }
        };
        if !reply.status {
            return Err(SyncError::Handshake {
                code: reply.status_code,
                message: reply.message(),
            });
        }
        if let ReplyData::RoomInfo(info) = reply.data {
            *lock(&self.inner.room_info) = info;
        }

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route replies and events
        let weak = Arc::downgrade(&self.inner);
        let pending = self.inner.pending.clone();
        let event_tx = self.inner.event_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(Frame::Response { id, reply }) => {
                            if let Some(tx) = lock(&pending).remove(&id) {
                                let _ = tx.send(reply);
                            }
                        }
                        Ok(Frame::Event(event)) => {
                            if !route_event(&weak, &event_tx, event).await {
                                break;
                            }
                        }
                        Ok(Frame::Request { .. }) => log::warn!("Relay sent a request frame"),
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail outstanding requests
            lock(&pending).clear();
            if let Some(inner) = weak.upgrade() {
                let mut slot = lock(&inner.link);
                slot.take();
                *lock(&inner.state) = ConnectionState::Disconnected;
            }
            log::info!("Relay connection closed");
            let _ = event_tx.send(TransportEvent::Disconnected).await;
        });

        Ok(Link {
            outgoing: out_tx,
            server_identity,
            reader,
            writer,
        })
    }

    fn handshake_payload(
        &self,
        server_identity: &str,
        owner: Option<&OwnerCapability>,
    ) -> Result<HandshakePayload, SyncError> {
        let inner = &self.inner;
        let mut tokens = lock(&inner.tokens);
        let token = tokens.collaborate(&inner.identity, server_identity, &inner.room_id)?;

        let (owner_token, owner_address, room_info) = match owner {
            Some(owner) => {
                let info = RoomInfo {
                    room_id: inner.room_id.clone(),
                    created_by: inner.member.name.clone(),
                    created_at: unix_now(),
                };
                let plain = bincode::serde::encode_to_vec(&info, bincode::config::standard())
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                (
                    Some(tokens.own(owner, server_identity, &inner.room_id)?),
                    Some(owner.address()),
                    Some(crypto::encrypt(&inner.room_key, &plain)?),
                )
            }
            None => (None, None, None),
        };

        Ok(HandshakePayload {
            token,
            session_identity: inner.identity.public_hex(),
            room_id: inner.room_id.clone(),
            member: inner.member.clone(),
            owner_token,
            owner_address,
            room_info,
        })
    }

    /// Close the connection. Outstanding requests fail.
    pub fn disconnect(&self) {
        if self.close_link() {
            log::info!("Disconnected from room {}", self.inner.room_id);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn close_link(&self) -> bool {
        let link = lock(&self.inner.link).take();
        lock(&self.inner.pending).clear();
        match link {
            Some(link) => {
                link.reader.abort();
                // Dropping the sender lets the writer flush and send Close.
                drop(link.outgoing);
                drop(link.writer);
                true
            }
            None => false,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.inner.state) = state;
    }

    fn outgoing(&self) -> Result<(mpsc::Sender<Vec<u8>>, String), SyncError> {
        lock(&self.inner.link)
            .as_ref()
            .map(|link| (link.outgoing.clone(), link.server_identity.clone()))
            .ok_or(SyncError::NotConnected)
    }

    async fn request(&self, call: Request) -> Result<Reply, SyncError> {
        let name = call.name();
        let (outgoing, _) = self.outgoing()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Request { id, call }.encode()?;

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);
        if outgoing.send(frame).await.is_err() {
            lock(&self.inner.pending).remove(&id);
            return Err(SyncError::NotConnected);
        }

        let reply = match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(SyncError::Connection(format!(
                    "connection closed awaiting {name}"
                )))
            }
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                return Err(SyncError::Connection(format!("{name} timed out")));
            }
        };
        if !reply.status {
            log::debug!("{name} rejected ({}): {}", reply.status_code, reply.message());
            return Err(SyncError::Rejected {
                code: reply.status_code,
                message: reply.message(),
            });
        }
        Ok(reply)
    }

    fn owner_token(
        &self,
        owner: &OwnerCapability,
    ) -> Result<crate::auth::CapabilityToken, SyncError> {
        let (_, server_identity) = self.outgoing()?;
        Ok(lock(&self.inner.tokens).own(owner, &server_identity, &self.inner.room_id)?)
    }

    /// Send one encrypted update; returns the id the relay assigned.
    pub async fn send_update(&self, data: Vec<u8>) -> Result<UpdateId, SyncError> {
        let reply = self.request(Request::SendUpdate { data }).await?;
        match reply.data {
            ReplyData::UpdateId(id) => Ok(id),
            _ => Err(ProtocolError::UnexpectedReply("send-update").into()),
        }
    }

    /// Register a snapshot superseding `update_ids`. Owner only.
    pub async fn commit_updates(
        &self,
        owner: &OwnerCapability,
        update_ids: Vec<UpdateId>,
        content_id: ContentId,
    ) -> Result<(), SyncError> {
        let owner_token = self.owner_token(owner)?;
        let call = Request::CommitUpdates {
            update_ids,
            content_id,
            owner_token,
        };
        match self.request(call).await {
            Ok(_) => Ok(()),
            Err(SyncError::Rejected { code, message }) => {
                Err(CommitError::Rejected { code, message }.into())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn fetch_latest_commit(&self) -> Result<Option<CommitRecord>, SyncError> {
        match self.request(Request::FetchLatestCommit).await?.data {
            ReplyData::Commit(commit) => Ok(commit),
            _ => Err(ProtocolError::UnexpectedReply("fetch-latest-commit").into()),
        }
    }

    /// Updates received by the relay since the latest commit, in id order.
    pub async fn fetch_uncommitted_changes(&self) -> Result<Vec<UpdateRecord>, SyncError> {
        match self.request(Request::FetchUncommittedChanges).await?.data {
            ReplyData::Updates(updates) => Ok(updates),
            _ => Err(ProtocolError::UnexpectedReply("fetch-uncommitted-changes").into()),
        }
    }

    pub async fn fetch_peers(&self) -> Result<Vec<RoomMember>, SyncError> {
        match self.request(Request::FetchPeers).await?.data {
            ReplyData::Peers(peers) => Ok(peers),
            _ => Err(ProtocolError::UnexpectedReply("fetch-peer-list").into()),
        }
    }

    /// Close the room for everyone. Owner only.
    pub async fn terminate_session(&self, owner: &OwnerCapability) -> Result<(), SyncError> {
        let owner_token = self.owner_token(owner)?;
        self.request(Request::TerminateSession { owner_token }).await?;
        log::info!("Terminated room {}", self.inner.room_id);
        Ok(())
    }

    /// Broadcast an encrypted awareness payload. Dropped while disconnected.
    pub fn broadcast_awareness(&self, data: Vec<u8>) {
        let Ok((outgoing, _)) = self.outgoing() else {
            log::trace!("Dropping awareness update while disconnected");
            return;
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = match (Frame::Request {
            id,
            call: Request::BroadcastAwareness { data },
        })
        .encode()
        {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Failed to encode awareness update: {e}");
                return;
            }
        };
        if outgoing.try_send(frame).is_err() {
            log::debug!("Outgoing queue full, dropping awareness update");
        }
    }

    /// Room metadata returned by the handshake, decrypted.
    pub fn room_info(&self) -> Result<Option<RoomInfo>, SyncError> {
        let sealed = lock(&self.inner.room_info).clone();
        let Some(sealed) = sealed else {
            return Ok(None);
        };
        let plain = crypto::decrypt(&self.inner.room_key, &sealed)?;
        let (info, _) = bincode::serde::decode_from_slice(&plain, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(Some(info))
    }
}

/// Forward one relay event. Returns false once the host side is gone.
async fn route_event(
    weak: &Weak<TransportInner>,
    event_tx: &mpsc::Sender<TransportEvent>,
    event: ServerEvent,
) -> bool {
    let event = match event {
        ServerEvent::Update(record) => TransportEvent::RemoteUpdate(record),
        ServerEvent::Awareness { peer_id, data } => TransportEvent::Awareness { peer_id, data },
        ServerEvent::SessionTerminated => TransportEvent::SessionTerminated,
        ServerEvent::MembershipChanged => {
            // The reply arrives on this reader, so the fetch runs elsewhere.
            if let Some(inner) = weak.upgrade() {
                let client = TransportClient { inner };
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    match client.fetch_peers().await {
                        Ok(peers) => {
                            let _ = event_tx.send(TransportEvent::Roster(peers)).await;
                        }
                        Err(e) => log::debug!("Roster refetch failed: {e}"),
                    }
                });
            }
            return true;
        }
        ServerEvent::Challenge { .. } => {
            log::warn!("Unexpected challenge on an established connection");
            return true;
        }
    };
    event_tx.send(event).await.is_ok()
}

async fn next_frame<S>(reader: &mut S, stage: &'static str) -> Result<Frame, SyncError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(Frame::decode(&data)?),
            Some(Ok(Message::Close(_))) | None => {
                return Err(SyncError::Connection(format!(
                    "connection closed during {stage}"
                )))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(closed(e)),
        }
    }
}

impl CommitRegistrar for TransportClient {
    fn register_commit<'a>(
        &'a self,
        owner: &'a OwnerCapability,
        update_ids: Vec<UpdateId>,
        content_id: ContentId,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(self.commit_updates(owner, update_ids, content_id))
    }
}

impl AwarenessSink for TransportClient {
    fn broadcast(&self, payload: Vec<u8>) {
        self.broadcast_awareness(payload);
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("room_id", &self.inner.room_id)
            .field("state", &self.connection_state())
            .finish()
    }
}
