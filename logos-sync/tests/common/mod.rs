//! Shared helpers: an in-process relay and document polling.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use logos_sync::{
    ContentStore, MemoryContentStore, Role, RoomKey, ServerConfig, SessionHandle, SharedDoc,
    SyncConfig, SyncServer, SyncSession, SyncState,
};
use tokio::net::TcpListener;
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

pub const ROOM: &str = "integration-room";
pub const WAIT: Duration = Duration::from_secs(5);

/// Start a relay on a free port. Returns its URL and a handle for inspection.
pub async fn start_relay() -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
    }));
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run_on(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), server)
}

pub fn config(url: &str, name: &str) -> SyncConfig {
    let mut config = SyncConfig::new(url, name);
    config.awareness_debounce = Duration::from_millis(20);
    config
}

pub fn spawn_session(
    config: SyncConfig,
    key: &RoomKey,
    role: Role,
    store: &MemoryContentStore,
) -> (SessionHandle, SharedDoc) {
    let doc = SharedDoc::new();
    let store: Arc<dyn ContentStore> = Arc::new(store.clone());
    let handle = SyncSession::spawn(config, ROOM, key.clone(), role, doc.clone(), store).unwrap();
    (handle, doc)
}

/// Connect and wait until the session is live.
pub async fn connect(handle: &SessionHandle) {
    handle.connect();
    assert!(
        handle.wait_for_state(SyncState::Connected, WAIT).await,
        "session did not reach Connected, stuck in {:?}",
        handle.state()
    );
}

/// Append `text` at the end of the shared text.
pub fn append(doc: &SharedDoc, text: &str) {
    let mut txn = doc.doc().transact_mut();
    let t = txn.get_or_insert_text("content");
    let len = t.len(&txn);
    t.insert(&mut txn, len, text);
}

pub fn content(doc: &SharedDoc) -> String {
    let txn = doc.doc().transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

/// Poll until `doc` reads `expected`.
pub async fn wait_for_content(doc: &SharedDoc, expected: &str) -> bool {
    poll(|| content(doc) == expected).await
}

pub async fn poll(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Poll until the relay holds exactly `n` uncommitted updates for [`ROOM`].
pub async fn wait_for_uncommitted(server: &SyncServer, n: usize) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if server.uncommitted_count(ROOM).await == Some(n) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub async fn wait_for_connections(server: &SyncServer, n: u64) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if server.stats().await.total_connections >= n {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
