//! Sync state machine.
//!
//! ```text
//! Disconnected ──Connect──► Connecting ──Connected──► SyncingLatestCommit
//!      ▲                        ▲                        │ FetchingFromIpfs
//!      │                        │ ConnectionLost         ├─► CommittingLocalContents (owner)
//!      │                        │ (under budget)         └─► SyncingLocalContents   (editor)
//!      │                        │                               │
//!      │                    Connected ◄─────────────────────────┘
//!      │                      ▲   │ local update queued
//!      │                      │   ▼
//!      │                    Processing { Updating ⇄ Committing }
//!      │
//!  Disconnecting ◄── Disconnect / Terminate / budget exhausted (from any state)
//! ```
//!
//! The machine is pure: [`SyncMachine::handle`] consumes one [`SyncEvent`]
//! and returns the [`Effect`]s the driver must run. Results of effects come
//! back as further events. Nothing here touches the network, the document
//! or the clock, so every transition is unit-testable.

use std::collections::VecDeque;

use crate::auth::Role;
use crate::commit::CommitBatcher;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::protocol::{RoomMember, UpdateId};

/// Catch-up sub-states of `SyncingLatestCommit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpStage {
    FetchingFromIpfs,
    CommittingLocalContents,
    SyncingLocalContents,
}

/// Sub-states of `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    Updating,
    Committing,
}

/// Machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Connecting,
    SyncingLatestCommit(CatchUpStage),
    Connected,
    Processing(ProcessingStage),
    Disconnecting,
}

impl SyncState {
    /// Whether a session is live (anything between connect and teardown).
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Disconnected | SyncState::Disconnecting)
    }
}

/// Transport connection status as seen by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Offline,
    Connecting,
    Online,
}

/// A decrypted update received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUpdate {
    pub id: UpdateId,
    pub update: Vec<u8>,
}

/// Result of the catch-up fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchUpOutcome {
    /// Ids of server-side updates not yet folded into a commit
    pub uncommitted_ids: Vec<UpdateId>,
}

/// Inputs to the machine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connect,
    /// Transport handshake succeeded
    Connected,
    CaughtUp(CatchUpOutcome),
    LocalUpdate(Vec<u8>),
    RemoteUpdate(RemoteUpdate),
    UpdateAcked(UpdateId),
    Committed(Vec<UpdateId>),
    RosterUpdated(Vec<RoomMember>),
    /// The in-flight effect failed
    StepFailed(SyncError),
    ConnectionLost,
    Disconnect,
    Terminate,
    TeardownComplete,
}

/// Host-facing notices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connected,
    Error(String),
    Disconnected,
}

/// Work the driver must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Connect + handshake; answers `Connected` or `StepFailed`
    OpenConnection,
    /// Fetch latest commit and uncommitted updates, merge them; answers `CaughtUp`
    CatchUp,
    /// Owner: snapshot the full state and commit `update_ids`; answers `Committed`
    CommitLocalContents { update_ids: Vec<UpdateId> },
    /// Merge and send a FIFO batch; answers `UpdateAcked`
    SendUpdate { updates: Vec<Vec<u8>> },
    /// Threshold commit; answers `Committed`
    Commit { update_ids: Vec<UpdateId> },
    /// Merge peer updates into the document
    ApplyRemote { updates: Vec<Vec<u8>> },
    /// Answer `ConnectionLost` if the transport is down
    CheckLiveness,
    RegisterAwareness,
    TerminateSession,
    /// Close the socket, unregister awareness; answers `TeardownComplete`
    Teardown,
    Notify(Notice),
}

/// Mutable machine context.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub room_id: String,
    pub role: Role,
    pub connection: ConnectionStatus,
    /// Local updates not yet handed to the transport (FIFO)
    pub pending: VecDeque<Vec<u8>>,
    /// Batch sent but not acknowledged
    pub in_flight: Vec<Vec<u8>>,
    /// Owner bookkeeping: acknowledged ids not yet in a commit
    pub uncommitted_ids: Vec<UpdateId>,
    /// Remote updates received during catch-up
    pub remote_queue: Vec<RemoteUpdate>,
    pub error_count: u32,
    pub members: Vec<RoomMember>,
    pub awareness_listening: bool,
    /// Host asked to connect while teardown was still running
    pub reconnect_requested: bool,
}

impl SyncContext {
    pub fn new(room_id: impl Into<String>, role: Role) -> Self {
        Self {
            room_id: room_id.into(),
            role,
            connection: ConnectionStatus::Offline,
            pending: VecDeque::new(),
            in_flight: Vec::new(),
            uncommitted_ids: Vec::new(),
            remote_queue: Vec::new(),
            error_count: 0,
            members: Vec::new(),
            awareness_listening: false,
            reconnect_requested: false,
        }
    }

    pub fn is_owner(&self) -> bool {
        self.role.owner_capability().is_some()
    }

    /// Reset to defaults, keeping only what must survive a reconnect.
    fn reset(&mut self) {
        self.requeue_in_flight();
        let pending = std::mem::take(&mut self.pending);
        *self = Self::new(std::mem::take(&mut self.room_id), self.role.clone());
        self.pending = pending;
    }

    /// Return an unacknowledged batch to the head of the queue.
    fn requeue_in_flight(&mut self) {
        for update in self.in_flight.drain(..).rev() {
            self.pending.push_front(update);
        }
    }

    fn track(&mut self, id: UpdateId) {
        if self.is_owner() && !self.uncommitted_ids.contains(&id) {
            self.uncommitted_ids.push(id);
        }
    }
}

/// The sync state machine.
pub struct SyncMachine {
    state: SyncState,
    ctx: SyncContext,
    batcher: CommitBatcher,
    max_retries: u32,
}

impl SyncMachine {
    pub fn new(room_id: impl Into<String>, role: Role, config: &SyncConfig) -> Self {
        Self {
            state: SyncState::Disconnected,
            ctx: SyncContext::new(room_id, role),
            batcher: CommitBatcher::new(config.commit_threshold),
            max_retries: config.max_retries.max(1),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Consume one event, returning the effects to run.
    pub fn handle(&mut self, event: SyncEvent) -> Vec<Effect> {
        let before = self.state;
        let effects = self.transition(event);
        if before != self.state {
            log::debug!("Sync state {before:?} -> {:?}", self.state);
        }
        effects
    }

    fn transition(&mut self, event: SyncEvent) -> Vec<Effect> {
        use SyncState::*;

        match event {
            SyncEvent::Connect => match self.state {
                Disconnected => self.begin_connect(),
                Disconnecting => {
                    log::debug!("Connect requested during teardown, deferring");
                    self.ctx.reconnect_requested = true;
                    Vec::new()
                }
                _ => Vec::new(),
            },

            SyncEvent::Connected => match self.state {
                Connecting => {
                    self.ctx.error_count = 0;
                    self.ctx.connection = ConnectionStatus::Online;
                    self.ctx.awareness_listening = true;
                    self.state = SyncingLatestCommit(CatchUpStage::FetchingFromIpfs);
                    vec![Effect::RegisterAwareness, Effect::CatchUp]
                }
                _ => self.stale("Connected"),
            },

            SyncEvent::CaughtUp(outcome) => match self.state {
                SyncingLatestCommit(CatchUpStage::FetchingFromIpfs) => {
                    self.ctx.error_count = 0;
                    if self.ctx.is_owner() {
                        for id in outcome.uncommitted_ids {
                            self.ctx.track(id);
                        }
                        self.state = SyncingLatestCommit(CatchUpStage::CommittingLocalContents);
                        vec![Effect::CommitLocalContents {
                            update_ids: self.ctx.uncommitted_ids.clone(),
                        }]
                    } else if self.ctx.pending.is_empty() {
                        self.enter_connected(true)
                    } else {
                        self.ctx.in_flight = self.ctx.pending.drain(..).collect();
                        self.state = SyncingLatestCommit(CatchUpStage::SyncingLocalContents);
                        vec![Effect::SendUpdate {
                            updates: self.ctx.in_flight.clone(),
                        }]
                    }
                }
                _ => self.stale("CaughtUp"),
            },

            SyncEvent::LocalUpdate(update) => {
                self.ctx.pending.push_back(update);
                match self.state {
                    Connected => self.start_updating(),
                    _ => Vec::new(),
                }
            }

            SyncEvent::RemoteUpdate(remote) => match self.state {
                Connecting | SyncingLatestCommit(_) => {
                    self.ctx.remote_queue.push(remote);
                    Vec::new()
                }
                Connected | Processing(_) => {
                    self.ctx.track(remote.id);
                    vec![Effect::ApplyRemote {
                        updates: vec![remote.update],
                    }]
                }
                Disconnected | Disconnecting => {
                    log::debug!("Dropping remote update {} outside a session", remote.id);
                    Vec::new()
                }
            },

            SyncEvent::UpdateAcked(id) => match self.state {
                SyncingLatestCommit(CatchUpStage::SyncingLocalContents) => {
                    self.ctx.in_flight.clear();
                    self.ctx.error_count = 0;
                    self.ctx.track(id);
                    self.enter_connected(true)
                }
                Processing(ProcessingStage::Updating) => {
                    self.ctx.in_flight.clear();
                    self.ctx.error_count = 0;
                    self.ctx.track(id);
                    if self
                        .batcher
                        .should_commit(&self.ctx.role, self.ctx.uncommitted_ids.len())
                    {
                        self.state = Processing(ProcessingStage::Committing);
                        vec![Effect::Commit {
                            update_ids: self.ctx.uncommitted_ids.clone(),
                        }]
                    } else if !self.ctx.pending.is_empty() {
                        self.start_updating()
                    } else {
                        self.enter_connected(false)
                    }
                }
                _ => self.stale("UpdateAcked"),
            },

            SyncEvent::Committed(ids) => match self.state {
                SyncingLatestCommit(CatchUpStage::CommittingLocalContents) => {
                    self.ctx.error_count = 0;
                    self.ctx.uncommitted_ids.retain(|id| !ids.contains(id));
                    self.enter_connected(true)
                }
                Processing(ProcessingStage::Committing) => {
                    self.ctx.error_count = 0;
                    self.ctx.uncommitted_ids.retain(|id| !ids.contains(id));
                    self.after_commit()
                }
                _ => self.stale("Committed"),
            },

            SyncEvent::RosterUpdated(members) => {
                if self.state.is_active() {
                    self.ctx.members = members;
                }
                Vec::new()
            }

            SyncEvent::StepFailed(error) => self.step_failed(error),

            SyncEvent::ConnectionLost => match self.state {
                SyncingLatestCommit(_) | Connected | Processing(_) => {
                    self.connection_failure(SyncError::NotConnected)
                }
                _ => Vec::new(),
            },

            SyncEvent::Disconnect => match self.state {
                Disconnected => Vec::new(),
                Disconnecting => {
                    self.ctx.reconnect_requested = false;
                    Vec::new()
                }
                _ => self.begin_disconnect(None),
            },

            SyncEvent::Terminate => match self.state {
                Disconnected | Disconnecting => Vec::new(),
                _ if self.ctx.is_owner() => {
                    let mut effects = vec![Effect::TerminateSession];
                    effects.extend(self.begin_disconnect(None));
                    effects
                }
                _ => vec![Effect::Notify(Notice::Error(
                    "Only the room owner can terminate the session".to_string(),
                ))],
            },

            SyncEvent::TeardownComplete => match self.state {
                Disconnecting => {
                    let reconnect = std::mem::take(&mut self.ctx.reconnect_requested);
                    self.ctx.reset();
                    self.state = Disconnected;
                    let mut effects = vec![Effect::Notify(Notice::Disconnected)];
                    if reconnect {
                        effects.extend(self.begin_connect());
                    }
                    effects
                }
                _ => Vec::new(),
            },
        }
    }

    fn step_failed(&mut self, error: SyncError) -> Vec<Effect> {
        use SyncState::*;

        match self.state {
            Connecting => {
                if self.exhausted() {
                    return self.give_up(&error);
                }
                log::warn!(
                    "Connect attempt {} failed, retrying: {error}",
                    self.ctx.error_count
                );
                vec![Effect::OpenConnection]
            }
            SyncingLatestCommit(_) | Processing(_) if error.is_connection() => {
                self.connection_failure(error)
            }
            SyncingLatestCommit(stage) => {
                if self.exhausted() {
                    return self.give_up(&error);
                }
                log::warn!("Catch-up step {stage:?} failed, retrying: {error}");
                vec![match stage {
                    CatchUpStage::FetchingFromIpfs => Effect::CatchUp,
                    CatchUpStage::CommittingLocalContents => Effect::CommitLocalContents {
                        update_ids: self.ctx.uncommitted_ids.clone(),
                    },
                    CatchUpStage::SyncingLocalContents => Effect::SendUpdate {
                        updates: self.ctx.in_flight.clone(),
                    },
                }]
            }
            Processing(ProcessingStage::Updating) => {
                if self.exhausted() {
                    return self.give_up(&error);
                }
                log::warn!("Send failed, retrying batch: {error}");
                vec![Effect::SendUpdate {
                    updates: self.ctx.in_flight.clone(),
                }]
            }
            Processing(ProcessingStage::Committing) => {
                if self.exhausted() {
                    return self.give_up(&error);
                }
                log::warn!(
                    "Commit failed, {} ids stay pending: {error}",
                    self.ctx.uncommitted_ids.len()
                );
                self.after_commit()
            }
            Connected | Disconnected | Disconnecting => self.stale("StepFailed"),
        }
    }

    /// Count one failure; true once the retry budget is used up.
    fn exhausted(&mut self) -> bool {
        self.ctx.error_count += 1;
        self.ctx.error_count >= self.max_retries
    }

    fn connection_failure(&mut self, error: SyncError) -> Vec<Effect> {
        if self.exhausted() {
            return self.give_up(&error);
        }
        log::warn!("Connection lost, reconnecting: {error}");
        self.ctx.requeue_in_flight();
        self.ctx.connection = ConnectionStatus::Connecting;
        self.state = SyncState::Connecting;
        vec![Effect::OpenConnection]
    }

    fn give_up(&mut self, error: &SyncError) -> Vec<Effect> {
        log::error!(
            "Giving up after {} failed attempts: {error}",
            self.ctx.error_count
        );
        self.begin_disconnect(Some(format!(
            "Collaboration session closed after {} failed attempts: {error}",
            self.ctx.error_count
        )))
    }

    fn begin_disconnect(&mut self, error: Option<String>) -> Vec<Effect> {
        self.ctx.requeue_in_flight();
        self.ctx.connection = ConnectionStatus::Offline;
        self.ctx.awareness_listening = false;
        self.ctx.members.clear();
        self.state = SyncState::Disconnecting;

        let mut effects = Vec::new();
        if let Some(message) = error {
            effects.push(Effect::Notify(Notice::Error(message)));
        }
        effects.push(Effect::Teardown);
        effects
    }

    fn begin_connect(&mut self) -> Vec<Effect> {
        self.state = SyncState::Connecting;
        self.ctx.connection = ConnectionStatus::Connecting;
        vec![Effect::OpenConnection]
    }

    fn start_updating(&mut self) -> Vec<Effect> {
        self.ctx.in_flight = self.ctx.pending.drain(..).collect();
        self.state = SyncState::Processing(ProcessingStage::Updating);
        vec![Effect::SendUpdate {
            updates: self.ctx.in_flight.clone(),
        }]
    }

    fn after_commit(&mut self) -> Vec<Effect> {
        if self.ctx.pending.is_empty() {
            self.enter_connected(false)
        } else {
            self.start_updating()
        }
    }

    fn enter_connected(&mut self, caught_up: bool) -> Vec<Effect> {
        self.state = SyncState::Connected;
        let mut effects = Vec::new();
        if caught_up {
            log::info!("Room {} synchronized", self.ctx.room_id);
            effects.push(Effect::Notify(Notice::Connected));
        }
        effects.push(Effect::CheckLiveness);

        if !self.ctx.remote_queue.is_empty() {
            let queued = std::mem::take(&mut self.ctx.remote_queue);
            let mut updates = Vec::with_capacity(queued.len());
            for remote in queued {
                self.ctx.track(remote.id);
                updates.push(remote.update);
            }
            effects.push(Effect::ApplyRemote { updates });
        }

        if !self.ctx.pending.is_empty() {
            effects.extend(self.start_updating());
        }
        effects
    }

    fn stale(&self, event: &str) -> Vec<Effect> {
        log::debug!("Ignoring {event} in state {:?}", self.state);
        Vec::new()
    }
}
