//! Owner commits: threshold batching and late joiners rebuilding from a
//! snapshot plus the uncommitted tail.

mod common;

use common::*;
use logos_sync::protocol::MemberRole;
use logos_sync::{MemoryContentStore, OwnerCapability, Role, RoomKey, TransportClient};

fn owner() -> Role {
    Role::Owner(OwnerCapability::from_seed([9u8; 32]))
}

#[tokio::test]
async fn test_owner_commits_after_threshold() {
    let (url, server) = start_relay().await;
    let key = RoomKey::generate();
    let store = MemoryContentStore::new();

    let (alice, doc) = spawn_session(config(&url, "Alice"), &key, owner(), &store);
    connect(&alice).await;
    // Connecting commits the (empty) local contents once.
    assert!(wait_for_uncommitted(&server, 0).await);

    for n in 1..10 {
        append(&doc, "x");
        assert!(wait_for_uncommitted(&server, n).await, "update {n} not stored");
    }

    // The tenth acknowledged update triggers a commit of all ten.
    append(&doc, "x");
    assert!(wait_for_uncommitted(&server, 0).await);

    let observer = TransportClient::new(config(&url, "Observer"), ROOM, key, MemberRole::Editor).unwrap();
    observer.connect(None).await.unwrap();
    let commit = observer.fetch_latest_commit().await.unwrap().unwrap();
    assert_eq!(commit.update_ids.len(), 10);
    assert!(observer.fetch_uncommitted_changes().await.unwrap().is_empty());
    assert!(!store.is_empty());
}

#[tokio::test]
async fn test_editor_never_commits() {
    let (url, server) = start_relay().await;
    let key = RoomKey::generate();
    let store = MemoryContentStore::new();

    let (bob, doc) = spawn_session(config(&url, "Bob"), &key, Role::Editor, &store);
    connect(&bob).await;

    for n in 1..=12 {
        append(&doc, "y");
        assert!(wait_for_uncommitted(&server, n).await);
    }
    assert!(server.latest_commit(ROOM).await.is_none());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_late_joiner_rebuilds_from_commit_and_tail() {
    let (url, server) = start_relay().await;
    let key = RoomKey::generate();
    let store = MemoryContentStore::new();

    let mut owner_config = config(&url, "Alice");
    owner_config.commit_threshold = 3;
    let (alice, alice_doc) = spawn_session(owner_config, &key, owner(), &store);
    connect(&alice).await;
    assert!(wait_for_uncommitted(&server, 0).await);

    for (n, word) in ["a", "b"].into_iter().enumerate() {
        append(&alice_doc, word);
        assert!(wait_for_uncommitted(&server, n + 1).await);
    }
    append(&alice_doc, "c");
    assert!(wait_for_uncommitted(&server, 0).await);
    assert_eq!(server.latest_commit(ROOM).await.unwrap().update_ids.len(), 3);

    // Two more updates stay uncommitted.
    append(&alice_doc, "d");
    assert!(wait_for_uncommitted(&server, 1).await);
    append(&alice_doc, "e");
    assert!(wait_for_uncommitted(&server, 2).await);

    let (bob, bob_doc) = spawn_session(config(&url, "Bob"), &key, Role::Editor, &store);
    connect(&bob).await;
    assert!(wait_for_content(&bob_doc, "abcde").await, "bob has {:?}", content(&bob_doc));
}

#[tokio::test]
async fn test_owner_folds_local_contents_into_commit_on_join() {
    let (url, server) = start_relay().await;
    let key = RoomKey::generate();
    let store = MemoryContentStore::new();

    let (bob, bob_doc) = spawn_session(config(&url, "Bob"), &key, Role::Editor, &store);
    connect(&bob).await;
    append(&bob_doc, "from bob");
    assert!(wait_for_uncommitted(&server, 1).await);

    // The owner catches up and commits what it found, before syncing its own edits.
    let (alice, alice_doc) = spawn_session(config(&url, "Alice"), &key, owner(), &store);
    connect(&alice).await;
    assert!(wait_for_content(&alice_doc, "from bob").await);
    assert!(wait_for_uncommitted(&server, 0).await);
    assert_eq!(server.latest_commit(ROOM).await.unwrap().update_ids.len(), 1);
}
