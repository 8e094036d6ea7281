//! End-to-end tests: real relay, real websocket clients.

mod common;

use common::*;
use logos_sync::protocol::MemberRole;
use logos_sync::{
    crypto, MemoryContentStore, OwnerCapability, Role, RoomKey, SessionEvent, SyncError,
    SyncState, TransportClient, TransportEvent,
};
use tokio::time::{timeout, Duration};

fn owner() -> Role {
    Role::Owner(OwnerCapability::from_seed([7u8; 32]))
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let (url, server) = start_relay().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to relay");
    assert!(wait_for_connections(&server, 1).await);
}

#[tokio::test]
async fn test_transport_send_and_fetch() {
    let (url, _server) = start_relay().await;
    let key = RoomKey::generate();

    let alice = TransportClient::new(config(&url, "Alice"), ROOM, key.clone(), MemberRole::Editor).unwrap();
    let bob = TransportClient::new(config(&url, "Bob"), ROOM, key.clone(), MemberRole::Editor).unwrap();
    let mut bob_rx = bob.take_event_rx().unwrap();

    alice.connect(None).await.unwrap();
    bob.connect(None).await.unwrap();
    assert!(alice.is_connected());
    assert!(alice.server_identity().is_some());

    let sealed = crypto::encrypt(&key, b"delta").unwrap();
    let id = alice.send_update(sealed.clone()).await.unwrap();

    // Bob sees the update; Alice never gets her own echo.
    let record = timeout(Duration::from_secs(2), async {
        loop {
            match bob_rx.recv().await {
                Some(TransportEvent::RemoteUpdate(record)) => return record,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(record.id, id);
    assert_eq!(crypto::decrypt(&key, &record.data).unwrap(), b"delta");

    let uncommitted = bob.fetch_uncommitted_changes().await.unwrap();
    assert_eq!(uncommitted.len(), 1);
    assert_eq!(uncommitted[0].data, sealed);
    assert!(bob.fetch_latest_commit().await.unwrap().is_none());

    let peers = alice.fetch_peers().await.unwrap();
    assert_eq!(peers.len(), 2);
}

#[tokio::test]
async fn test_wrong_key_is_rejected() {
    let (url, _server) = start_relay().await;

    let first = TransportClient::new(config(&url, "Alice"), ROOM, RoomKey::generate(), MemberRole::Editor).unwrap();
    first.connect(None).await.unwrap();

    let intruder = TransportClient::new(config(&url, "Mallory"), ROOM, RoomKey::generate(), MemberRole::Editor).unwrap();
    match intruder.connect(None).await {
        Err(SyncError::Handshake { code, .. }) => assert_eq!(code, 403),
        other => panic!("expected handshake rejection, got {other:?}"),
    }
    assert!(!intruder.is_connected());
}

#[tokio::test]
async fn test_owner_room_info_round_trip() {
    let (url, _server) = start_relay().await;
    let key = RoomKey::generate();
    let owner = OwnerCapability::from_seed([3u8; 32]);

    let client = TransportClient::new(config(&url, "Owner"), ROOM, key.clone(), MemberRole::Owner).unwrap();
    client.connect(Some(&owner)).await.unwrap();
    let info = client.room_info().unwrap().unwrap();
    assert_eq!(info.room_id, ROOM);
    assert_eq!(info.created_by, "Owner");

    // A later editor decrypts the same metadata.
    let editor = TransportClient::new(config(&url, "Editor"), ROOM, key, MemberRole::Editor).unwrap();
    editor.connect(None).await.unwrap();
    assert_eq!(editor.room_info().unwrap().unwrap(), info);
}

#[tokio::test]
async fn test_two_sessions_sync_text() {
    let (url, _server) = start_relay().await;
    let key = RoomKey::generate();
    let store = MemoryContentStore::new();

    let (alice, alice_doc) = spawn_session(config(&url, "Alice"), &key, owner(), &store);
    let (bob, bob_doc) = spawn_session(config(&url, "Bob"), &key, Role::Editor, &store);
    connect(&alice).await;
    connect(&bob).await;

    append(&alice_doc, "Hello");
    assert!(wait_for_content(&bob_doc, "Hello").await, "bob has {:?}", content(&bob_doc));

    append(&bob_doc, ", world");
    assert!(
        wait_for_content(&alice_doc, "Hello, world").await,
        "alice has {:?}",
        content(&alice_doc)
    );
}

#[tokio::test]
async fn test_edits_made_offline_are_sent_on_connect() {
    let (url, _server) = start_relay().await;
    let key = RoomKey::generate();
    let store = MemoryContentStore::new();

    let (alice, alice_doc) = spawn_session(config(&url, "Alice"), &key, owner(), &store);
    connect(&alice).await;

    let (bob, bob_doc) = spawn_session(config(&url, "Bob"), &key, Role::Editor, &store);
    append(&bob_doc, "drafted offline");
    connect(&bob).await;

    assert!(wait_for_content(&alice_doc, "drafted offline").await);
}

#[tokio::test]
async fn test_roster_updates_on_join() {
    let (url, _server) = start_relay().await;
    let key = RoomKey::generate();
    let store = MemoryContentStore::new();

    let (mut alice, _) = spawn_session(config(&url, "Alice"), &key, owner(), &store);
    let mut events = alice.take_event_rx().unwrap();
    connect(&alice).await;

    let (bob, _) = spawn_session(config(&url, "Bob"), &key, Role::Editor, &store);
    connect(&bob).await;

    let roster = timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(SessionEvent::Roster(members)) if members.len() == 2 => return members,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert!(roster.iter().any(|m| m.name == "Bob"));
}

#[tokio::test]
async fn test_owner_terminates_room() {
    let (url, server) = start_relay().await;
    let key = RoomKey::generate();
    let store = MemoryContentStore::new();

    let (alice, _) = spawn_session(config(&url, "Alice"), &key, owner(), &store);
    let (mut bob, _) = spawn_session(config(&url, "Bob"), &key, Role::Editor, &store);
    let mut bob_events = bob.take_event_rx().unwrap();
    connect(&alice).await;
    connect(&bob).await;

    alice.terminate();

    let terminated = timeout(Duration::from_secs(3), async {
        loop {
            match bob_events.recv().await {
                Some(SessionEvent::SessionTerminated) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(terminated);
    assert!(bob.wait_for_state(SyncState::Disconnected, WAIT).await);
    assert!(alice.wait_for_state(SyncState::Disconnected, WAIT).await);
    assert!(server.uncommitted_count(ROOM).await.is_none());
}

#[tokio::test]
async fn test_editor_cannot_terminate() {
    let (url, _server) = start_relay().await;
    let key = RoomKey::generate();
    let store = MemoryContentStore::new();

    let (alice, _) = spawn_session(config(&url, "Alice"), &key, owner(), &store);
    let (bob, _) = spawn_session(config(&url, "Bob"), &key, Role::Editor, &store);
    connect(&alice).await;
    connect(&bob).await;

    bob.terminate();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alice.state(), SyncState::Connected);
    assert_eq!(bob.state(), SyncState::Connected);
}

#[tokio::test]
async fn test_disconnect_then_reconnect() {
    let (url, server) = start_relay().await;
    let key = RoomKey::generate();
    let store = MemoryContentStore::new();

    // Editors never commit, so every update stays on the relay.
    let (alice, alice_doc) = spawn_session(config(&url, "Alice"), &key, Role::Editor, &store);
    connect(&alice).await;
    append(&alice_doc, "one");
    assert!(wait_for_uncommitted(&server, 1).await);

    alice.disconnect();
    assert!(alice.wait_for_state(SyncState::Disconnected, WAIT).await);

    append(&alice_doc, " two");
    connect(&alice).await;
    assert!(wait_for_uncommitted(&server, 2).await);
}
