//! Session driver: runs the [`SyncMachine`] against real I/O.
//!
//! One task per session multiplexes host commands, local document updates,
//! relay events and the single in-flight async step:
//!
//! ```text
//!  host commands ─┐
//!  doc updates ───┤                ┌── sync effects (apply, notify, ...)
//!  relay events ──┼─► machine ─────┤
//!  step result ───┘      ▲         └── async effect ─► step future ─┐
//!                        └──────────────── SyncEvent ◄──────────────┘
//! ```
//!
//! A newly started async effect supersedes the one in flight: the machine
//! only emits one when it has moved to a new stage.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::Role;
use crate::awareness::{AwarenessChannel, AwarenessState};
use crate::commit::{self, CommitBatcher};
use crate::config::SyncConfig;
use crate::content::ContentStore;
use crate::crypto::{self, RoomKey};
use crate::document::{merge_updates, SharedDoc, UpdateOrigin};
use crate::error::SyncError;
use crate::machine::{CatchUpOutcome, Effect, Notice, RemoteUpdate, SyncEvent, SyncMachine, SyncState};
use crate::protocol::{CommitRecord, RoomMember, UpdateRecord};
use crate::transport::{RoomInfo, TransportClient, TransportEvent};

/// Notifications delivered to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Caught up and live
    Connected,
    /// Stable, human-readable failure
    Error(String),
    Disconnected,
    Roster(Vec<RoomMember>),
    PresenceChanged(HashMap<Uuid, AwarenessState>),
    /// The room owner closed the room
    SessionTerminated,
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Terminate,
    SetAwareness(AwarenessState),
}

/// Host-facing handle to a running session.
///
/// Dropping the handle disconnects a session that was ever started.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SyncState>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    transport: TransportClient,
    started: AtomicBool,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Begin connecting.
    pub fn connect(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.send(Command::Connect);
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Close the room for every member. Owner only; editors get an error event.
    pub fn terminate(&self) {
        self.send(Command::Terminate);
    }

    /// Publish local presence (debounced).
    pub fn set_awareness(&self, state: AwarenessState) {
        self.send(Command::SetAwareness(state));
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Wait until the machine reaches `target`. False on timeout.
    pub async fn wait_for_state(&self, target: SyncState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map(|reached| reached.is_ok())
            .unwrap_or(false)
    }

    /// Take the host event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    /// This session's roster entry.
    pub fn member(&self) -> &RoomMember {
        self.transport.member()
    }

    /// Room metadata returned by the relay, decrypted.
    pub fn room_info(&self) -> Result<Option<RoomInfo>, SyncError> {
        self.transport.room_info()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("Session task already stopped");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            let _ = self.commands.send(Command::Disconnect);
        }
    }
}

/// The session driver.
pub struct SyncSession {
    machine: SyncMachine,
    role: Role,
    room_key: RoomKey,
    doc: SharedDoc,
    store: Arc<dyn ContentStore>,
    transport: TransportClient,
    awareness: AwarenessChannel,
    batcher: CommitBatcher,
    events: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<SyncState>,
    step: Option<BoxFuture<'static, SyncEvent>>,
    inbox: VecDeque<SyncEvent>,
    terminate_requested: bool,
}

impl SyncSession {
    /// Spawn a session task for `room_id` and return its handle.
    ///
    /// The session stays `Disconnected` until [`SessionHandle::connect`].
    pub fn spawn(
        config: SyncConfig,
        room_id: impl Into<String>,
        room_key: RoomKey,
        role: Role,
        doc: SharedDoc,
        store: Arc<dyn ContentStore>,
    ) -> Result<SessionHandle, SyncError> {
        let room_id = room_id.into();
        let transport =
            TransportClient::new(config.clone(), room_id.clone(), room_key.clone(), role.member_role())?;
        let transport_rx = transport
            .take_event_rx()
            .ok_or_else(|| SyncError::Connection("transport events already taken".to_string()))?;
        let doc_updates = doc.subscribe()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SyncState::Disconnected);

        let session = SyncSession {
            machine: SyncMachine::new(room_id, role.clone(), &config),
            role,
            awareness: AwarenessChannel::new(
                transport.member().peer_id,
                room_key.clone(),
                config.awareness_debounce,
            ),
            room_key,
            doc,
            store,
            transport: transport.clone(),
            batcher: CommitBatcher::new(config.commit_threshold),
            events: events_tx,
            state_tx,
            step: None,
            inbox: VecDeque::new(),
            terminate_requested: false,
        };

        let task = tokio::spawn(session.run(commands_rx, doc_updates, transport_rx));

        Ok(SessionHandle {
            commands: commands_tx,
            state: state_rx,
            events: Some(events_rx),
            transport,
            started: AtomicBool::new(false),
            task,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut doc_updates: crate::document::DocUpdates,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        let mut host_gone = false;

        loop {
            tokio::select! {
                command = commands.recv(), if !host_gone => match command {
                    Some(command) => self.command(command),
                    None => {
                        host_gone = true;
                        self.dispatch(SyncEvent::Disconnect);
                    }
                },
                Some(update) = doc_updates.recv() => {
                    if update.origin == UpdateOrigin::Local {
                        self.dispatch(SyncEvent::LocalUpdate(update.update));
                    }
                }
                Some(event) = transport_rx.recv() => self.transport_event(event),
                event = next_step(&mut self.step) => {
                    self.step = None;
                    self.dispatch(event);
                }
            }

            if host_gone && self.machine.state() == SyncState::Disconnected && self.step.is_none() {
                break;
            }
        }
        log::debug!("Session task for {} stopped", self.machine.context().room_id);
    }

    fn command(&mut self, command: Command) {
        match command {
            Command::Connect => self.dispatch(SyncEvent::Connect),
            Command::Disconnect => self.dispatch(SyncEvent::Disconnect),
            Command::Terminate => self.dispatch(SyncEvent::Terminate),
            Command::SetAwareness(state) => self.awareness.set_local_state(state),
        }
    }

    fn transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::RemoteUpdate(record) => match crypto::decrypt(&self.room_key, &record.data) {
                Ok(update) => self.dispatch(SyncEvent::RemoteUpdate(RemoteUpdate {
                    id: record.id,
                    update,
                })),
                Err(e) => log::warn!("Skipping undecryptable update {}: {e}", record.id),
            },
            TransportEvent::Awareness { peer_id, data } => match self.awareness.handle_remote(peer_id, &data) {
                Ok(true) => {
                    let states = self.awareness.registry().states();
                    self.notify(SessionEvent::PresenceChanged(states));
                }
                Ok(false) => {}
                Err(e) => log::warn!("Skipping awareness from {peer_id}: {e}"),
            },
            TransportEvent::Roster(members) => {
                if self.awareness.prune_to_roster(&members) {
                    let states = self.awareness.registry().states();
                    self.notify(SessionEvent::PresenceChanged(states));
                }
                self.dispatch(SyncEvent::RosterUpdated(members.clone()));
                self.notify(SessionEvent::Roster(members));
            }
            TransportEvent::SessionTerminated => {
                log::info!("Room {} terminated by its owner", self.machine.context().room_id);
                self.notify(SessionEvent::SessionTerminated);
                self.dispatch(SyncEvent::Disconnect);
            }
            TransportEvent::Disconnected => self.dispatch(SyncEvent::ConnectionLost),
        }
    }

    /// Feed one event, running every effect it (transitively) produces.
    fn dispatch(&mut self, event: SyncEvent) {
        self.inbox.push_back(event);
        while let Some(event) = self.inbox.pop_front() {
            let effects = self.machine.handle(event);
            self.state_tx.send_replace(self.machine.state());
            for effect in effects {
                self.run_effect(effect);
            }
        }
    }

    fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::OpenConnection => {
                let transport = self.transport.clone();
                let owner = self.role.owner_capability().cloned();
                self.start(async move {
                    match transport.connect(owner.as_ref()).await {
                        Ok(()) => SyncEvent::Connected,
                        Err(e) => SyncEvent::StepFailed(e),
                    }
                });
            }
            Effect::CatchUp => {
                let transport = self.transport.clone();
                let store = self.store.clone();
                let key = self.room_key.clone();
                let doc = self.doc.clone();
                self.start(async move {
                    match catch_up(&transport, store.as_ref(), &key, &doc).await {
                        Ok(outcome) => SyncEvent::CaughtUp(outcome),
                        Err(e) => SyncEvent::StepFailed(e),
                    }
                });
            }
            Effect::CommitLocalContents { update_ids } | Effect::Commit { update_ids } => {
                let batcher = self.batcher;
                let role = self.role.clone();
                let key = self.room_key.clone();
                let doc = self.doc.clone();
                let store = self.store.clone();
                let transport = self.transport.clone();
                self.start(async move {
                    let ids = update_ids.clone();
                    match batcher
                        .commit(&role, &key, &doc, store.as_ref(), &transport, update_ids)
                        .await
                    {
                        Ok(_) => SyncEvent::Committed(ids),
                        Err(e) => SyncEvent::StepFailed(e),
                    }
                });
            }
            Effect::SendUpdate { updates } => {
                let transport = self.transport.clone();
                let key = self.room_key.clone();
                self.start(async move {
                    match send_batch(&transport, &key, &updates).await {
                        Ok(id) => SyncEvent::UpdateAcked(id),
                        Err(e) => SyncEvent::StepFailed(e),
                    }
                });
            }
            Effect::ApplyRemote { updates } => {
                for update in updates {
                    if let Err(e) = self.doc.apply_update(&update, UpdateOrigin::Remote) {
                        log::warn!("Skipping remote update that failed to apply: {e}");
                    }
                }
            }
            Effect::CheckLiveness => {
                if !self.transport.is_connected() {
                    self.inbox.push_back(SyncEvent::ConnectionLost);
                }
            }
            Effect::RegisterAwareness => {
                self.awareness.register(Arc::new(self.transport.clone()));
            }
            Effect::TerminateSession => self.terminate_requested = true,
            Effect::Teardown => {
                if self.awareness.is_listening() {
                    match self.awareness.seal_leave() {
                        Ok(leave) => self.transport.broadcast_awareness(leave),
                        Err(e) => log::debug!("Could not announce leave: {e}"),
                    }
                }
                self.awareness.unregister();

                let transport = self.transport.clone();
                let owner = if std::mem::take(&mut self.terminate_requested) {
                    self.role.owner_capability().cloned()
                } else {
                    None
                };
                self.start(async move {
                    if let Some(owner) = owner {
                        if let Err(e) = transport.terminate_session(&owner).await {
                            log::warn!("Terminate request failed: {e}");
                        }
                    }
                    transport.disconnect();
                    SyncEvent::TeardownComplete
                });
            }
            Effect::Notify(notice) => self.notify(match notice {
                Notice::Connected => SessionEvent::Connected,
                Notice::Error(message) => SessionEvent::Error(message),
                Notice::Disconnected => SessionEvent::Disconnected,
            }),
        }
    }

    /// Replace the in-flight step.
    fn start<F>(&mut self, step: F)
    where
        F: std::future::Future<Output = SyncEvent> + Send + 'static,
    {
        if self.step.is_some() {
            log::trace!("Superseding in-flight step");
        }
        self.step = Some(Box::pin(step));
    }

    fn notify(&self, event: SessionEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::debug!("Host event dropped: {e}");
        }
    }
}

async fn next_step(step: &mut Option<BoxFuture<'static, SyncEvent>>) -> SyncEvent {
    match step.as_mut() {
        Some(step) => step.await,
        None => std::future::pending().await,
    }
}

/// Merge a FIFO batch into one update, seal it and send it.
async fn send_batch(
    transport: &TransportClient,
    key: &RoomKey,
    updates: &[Vec<u8>],
) -> Result<crate::protocol::UpdateId, SyncError> {
    let merged = merge_updates(updates)?;
    let sealed = crypto::encrypt(key, &merged)?;
    transport.send_update(sealed).await
}

/// Attempts at reading a consistent commit + tail before giving up.
const CATCH_UP_ATTEMPTS: usize = 3;

/// Relay reads needed to rebuild the document.
trait CatchUpSource: Send + Sync {
    fn latest_commit(&self) -> BoxFuture<'_, Result<Option<CommitRecord>, SyncError>>;
    fn uncommitted_changes(&self) -> BoxFuture<'_, Result<Vec<UpdateRecord>, SyncError>>;
}

impl CatchUpSource for TransportClient {
    fn latest_commit(&self) -> BoxFuture<'_, Result<Option<CommitRecord>, SyncError>> {
        Box::pin(self.fetch_latest_commit())
    }

    fn uncommitted_changes(&self) -> BoxFuture<'_, Result<Vec<UpdateRecord>, SyncError>> {
        Box::pin(self.fetch_uncommitted_changes())
    }
}

/// Read the latest commit and the uncommitted tail as one consistent pair.
///
/// A commit landing between the two reads removes ids from the tail that
/// the earlier snapshot does not cover, so the commit is read again after
/// the tail and the pair is refetched if it moved.
async fn consistent_view(
    source: &dyn CatchUpSource,
) -> Result<(Option<CommitRecord>, Vec<UpdateRecord>), SyncError> {
    for attempt in 1..=CATCH_UP_ATTEMPTS {
        let latest = source.latest_commit().await?;
        let records = source.uncommitted_changes().await?;
        let confirmed = source.latest_commit().await?;
        let content_id = |c: &Option<CommitRecord>| c.as_ref().map(|c| c.content_id.clone());
        if content_id(&latest) == content_id(&confirmed) {
            return Ok((confirmed, records));
        }
        log::debug!("Commit moved during catch-up (attempt {attempt}), reading again");
    }
    Err(SyncError::Connection(
        "room kept committing during catch-up".to_string(),
    ))
}

/// Rebuild the document from the latest commit plus uncommitted updates.
///
/// A snapshot that cannot be fetched or decrypted fails the attempt; an
/// individual update that cannot be decrypted is skipped.
async fn catch_up(
    source: &dyn CatchUpSource,
    store: &dyn ContentStore,
    key: &RoomKey,
    doc: &SharedDoc,
) -> Result<CatchUpOutcome, SyncError> {
    let (latest, records) = consistent_view(source).await?;

    if let Some(latest) = latest {
        let sealed = store.fetch(&latest.content_id).await?;
        let snapshot = commit::open_snapshot(key, &sealed)?;
        doc.apply_update(&snapshot, UpdateOrigin::Remote)?;
        log::debug!(
            "Applied snapshot {} covering {} updates",
            latest.content_id,
            latest.update_ids.len()
        );
    }

    let mut uncommitted_ids = Vec::with_capacity(records.len());
    let mut updates = Vec::with_capacity(records.len());
    for record in records {
        uncommitted_ids.push(record.id);
        match crypto::decrypt(key, &record.data) {
            Ok(update) => updates.push(update),
            Err(e) => log::warn!("Skipping undecryptable update {}: {e}", record.id),
        }
    }

    if !updates.is_empty() {
        match merge_updates(&updates) {
            Ok(merged) => doc.apply_update(&merged, UpdateOrigin::Remote)?,
            Err(e) => {
                log::warn!("Merging {} updates failed, applying one by one: {e}", updates.len());
                for update in &updates {
                    if let Err(e) = doc.apply_update(update, UpdateOrigin::Remote) {
                        log::warn!("Skipping update that failed to apply: {e}");
                    }
                }
            }
        }
    }

    log::info!("Caught up with {} uncommitted updates", uncommitted_ids.len());
    Ok(CatchUpOutcome { uncommitted_ids })
}
