//! Per-room fan-out on the relay.
//!
//! Uses a tokio broadcast channel so one send reaches every member's
//! connection task. Frames are encoded once and shared behind an `Arc`;
//! each connection skips frames whose origin is its own peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::protocol::{Frame, RoomMember, ServerEvent};

/// One encoded frame plus the peer it must not be echoed to.
#[derive(Debug)]
pub struct RoomBroadcast {
    /// `None` delivers to every member
    pub origin: Option<Uuid>,
    pub frame: Vec<u8>,
}

impl RoomBroadcast {
    pub fn is_for(&self, peer_id: &Uuid) -> bool {
        self.origin.as_ref() != Some(peer_id)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomBroadcast>>,
    members: RwLock<HashMap<Uuid, RoomMember>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a slow member may lag before it drops frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a member and return its receiver.
    pub async fn add_member(&self, member: RoomMember) -> broadcast::Receiver<Arc<RoomBroadcast>> {
        self.members.write().await.insert(member.peer_id, member);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, peer_id: &Uuid) -> Option<RoomMember> {
        self.members.write().await.remove(peer_id)
    }

    /// Encode `event` once and fan it out to everyone except `origin`.
    ///
    /// Returns the number of receivers the frame reached.
    pub fn broadcast_event(
        &self,
        origin: Option<Uuid>,
        event: ServerEvent,
    ) -> Result<usize, ProtocolError> {
        let frame = Frame::Event(event).encode()?;
        Ok(self.broadcast_raw(Arc::new(RoomBroadcast { origin, frame })))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, message: Arc<RoomBroadcast>) -> usize {
        let count = self.sender.send(message).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Count frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Current roster.
    pub async fn members(&self) -> Vec<RoomMember> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, peer_id: &Uuid) -> bool {
        self.members.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
