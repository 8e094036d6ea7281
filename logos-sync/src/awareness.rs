//! Awareness channel: ephemeral presence shared between room members.
//!
//! ```text
//! set_local_state() ─► watch slot ─► debounce task (window) ─► seal ─► sink
//!                        (latest wins)
//! relay Awareness event ─► open ─► PresenceRegistry (last-write-wins by clock)
//! ```
//!
//! Presence is never persisted and never acknowledged. Bursts of local
//! changes inside one debounce window collapse into a single broadcast of
//! the latest state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::crypto::{self, RoomKey};
use crate::error::{ProtocolError, SyncError};
use crate::protocol::RoomMember;

/// RGBA color for a peer's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a peer id.
    pub fn from_peer(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Text cursor or selection in document positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn caret(position: u32) -> Self {
        Self { anchor: position, head: position }
    }
}

/// A peer's presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user_name: String,
    pub color: CursorColor,
    pub cursor: Option<CursorRange>,
    /// Free-form host fields (e.g. active slide, viewport)
    pub fields: HashMap<String, String>,
}

impl AwarenessState {
    pub fn new(user_name: impl Into<String>, color: CursorColor) -> Self {
        Self {
            user_name: user_name.into(),
            color,
            cursor: None,
            fields: HashMap::new(),
        }
    }

    pub fn with_cursor(mut self, cursor: CursorRange) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Wire body of one awareness broadcast. `state: None` announces a leave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessMessage {
    pub peer_id: Uuid,
    /// Sender-local monotonic clock
    pub clock: u64,
    pub state: Option<AwarenessState>,
}

impl AwarenessMessage {
    /// Serialize and encrypt under the room key.
    pub fn seal(&self, key: &RoomKey) -> Result<Vec<u8>, SyncError> {
        let plain = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(crypto::encrypt(key, &plain)?)
    }

    /// Decrypt and deserialize.
    pub fn open(key: &RoomKey, sealed: &[u8]) -> Result<Self, SyncError> {
        let plain = crypto::decrypt(key, sealed)?;
        let (msg, _) = bincode::serde::decode_from_slice(&plain, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

#[derive(Debug, Clone)]
struct PeerPresence {
    clock: u64,
    state: AwarenessState,
}

/// Presence of every remote peer, keyed by peer id.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    local_peer: Uuid,
    peers: HashMap<Uuid, PeerPresence>,
}

impl PresenceRegistry {
    pub fn new(local_peer: Uuid) -> Self {
        Self {
            local_peer,
            peers: HashMap::new(),
        }
    }

    /// Apply a received message. Returns whether the registry changed.
    pub fn apply(&mut self, msg: AwarenessMessage) -> bool {
        if msg.peer_id == self.local_peer {
            return false;
        }
        if let Some(existing) = self.peers.get(&msg.peer_id) {
            if msg.clock <= existing.clock {
                log::trace!("Stale awareness from {} (clock {})", msg.peer_id, msg.clock);
                return false;
            }
        }
        match msg.state {
            Some(state) => {
                self.peers.insert(
                    msg.peer_id,
                    PeerPresence {
                        clock: msg.clock,
                        state,
                    },
                );
            }
            None => {
                log::debug!("Peer {} left", msg.peer_id);
                self.peers.remove(&msg.peer_id);
            }
        }
        true
    }

    pub fn get(&self, peer_id: &Uuid) -> Option<&AwarenessState> {
        self.peers.get(peer_id).map(|p| &p.state)
    }

    /// Snapshot of all known peers.
    pub fn states(&self) -> HashMap<Uuid, AwarenessState> {
        self.peers
            .iter()
            .map(|(id, p)| (*id, p.state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Forget peers that are no longer in `members`. Returns whether any were removed.
    pub fn retain_members(&mut self, members: &[RoomMember]) -> bool {
        let before = self.peers.len();
        self.peers
            .retain(|peer_id, _| members.iter().any(|m| m.peer_id == *peer_id));
        self.peers.len() != before
    }
}

/// Unacknowledged outlet for sealed awareness payloads.
pub trait AwarenessSink: Send + Sync + 'static {
    fn broadcast(&self, payload: Vec<u8>);
}

/// Debounced local broadcast plus remote registry.
pub struct AwarenessChannel {
    local_peer: Uuid,
    key: RoomKey,
    debounce: Duration,
    latest: watch::Sender<Option<AwarenessState>>,
    clock: Arc<AtomicU64>,
    registry: PresenceRegistry,
    task: Option<JoinHandle<()>>,
}

impl AwarenessChannel {
    pub fn new(local_peer: Uuid, key: RoomKey, debounce: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            local_peer,
            key,
            debounce,
            latest,
            clock: Arc::new(AtomicU64::new(0)),
            registry: PresenceRegistry::new(local_peer),
            task: None,
        }
    }

    /// Start broadcasting through `sink`. A no-op while already listening.
    pub fn register(&mut self, sink: Arc<dyn AwarenessSink>) {
        if self.is_listening() {
            return;
        }
        let mut rx = self.latest.subscribe();
        // Re-announce a state set before registration.
        if rx.borrow().is_some() {
            rx.mark_changed();
        }
        self.task = Some(tokio::spawn(debounce_loop(
            rx,
            sink,
            self.key.clone(),
            self.local_peer,
            self.clock.clone(),
            self.debounce,
        )));
        log::debug!("Awareness listener registered");
    }

    /// Stop broadcasting and forget remote presence.
    pub fn unregister(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            log::debug!("Awareness listener unregistered");
        }
        self.registry.clear();
    }

    pub fn is_listening(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Replace the local state; broadcast after the debounce window.
    pub fn set_local_state(&self, state: AwarenessState) {
        self.latest.send_replace(Some(state));
    }

    /// Sealed leave announcement, sent immediately on teardown.
    pub fn seal_leave(&self) -> Result<Vec<u8>, SyncError> {
        AwarenessMessage {
            peer_id: self.local_peer,
            clock: self.clock.fetch_add(1, Ordering::Relaxed) + 1,
            state: None,
        }
        .seal(&self.key)
    }

    pub fn local_state(&self) -> Option<AwarenessState> {
        self.latest.borrow().clone()
    }

    /// Decrypt and apply a payload the relay attributed to `sender`.
    /// Returns whether presence changed.
    ///
    /// A payload claiming a different peer id than its sender is ignored.
    pub fn handle_remote(&mut self, sender: Uuid, sealed: &[u8]) -> Result<bool, SyncError> {
        let msg = AwarenessMessage::open(&self.key, sealed)?;
        if msg.peer_id != sender {
            log::warn!("Ignoring awareness from {sender} claiming to be {}", msg.peer_id);
            return Ok(false);
        }
        Ok(self.registry.apply(msg))
    }

    /// Drop presence of peers missing from the latest roster.
    pub fn prune_to_roster(&mut self, members: &[RoomMember]) -> bool {
        self.registry.retain_members(members)
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }
}

impl Drop for AwarenessChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn debounce_loop(
    mut rx: watch::Receiver<Option<AwarenessState>>,
    sink: Arc<dyn AwarenessSink>,
    key: RoomKey,
    peer_id: Uuid,
    clock: Arc<AtomicU64>,
    window: Duration,
) {
    while rx.changed().await.is_ok() {
        tokio::time::sleep(window).await;
        let state = rx.borrow_and_update().clone();
        let msg = AwarenessMessage {
            peer_id,
            clock: clock.fetch_add(1, Ordering::Relaxed) + 1,
            state,
        };
        match msg.seal(&key) {
            Ok(payload) => sink.broadcast(payload),
            Err(e) => log::warn!("Failed to seal awareness update: {e}"),
        }
    }
}
