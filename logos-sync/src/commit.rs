//! Commit batcher: folds uncommitted updates into a durable snapshot.
//!
//! ```text
//! full doc state ─► LZ4 ─► encrypt(room key) ─► ContentStore::upload
//!                                                      │ content id
//!                                                      ▼
//!                               relay.commit_updates(ids, content id)
//! ```
//!
//! Only the owner commits: the relay accepts `commit_updates` only with an
//! own-scoped token. On failure the ids stay pending and the next threshold
//! trigger retries with the larger set.

use futures_util::future::BoxFuture;

use crate::auth::{OwnerCapability, Role};
use crate::content::ContentStore;
use crate::crypto::{self, RoomKey};
use crate::document::SharedDoc;
use crate::error::{CommitError, SyncError};
use crate::protocol::{ContentId, UpdateId};

/// Relay side of a commit: marks `update_ids` as superseded by `content_id`.
pub trait CommitRegistrar: Send + Sync {
    fn register_commit<'a>(
        &'a self,
        owner: &'a OwnerCapability,
        update_ids: Vec<UpdateId>,
        content_id: ContentId,
    ) -> BoxFuture<'a, Result<(), SyncError>>;
}

/// Threshold policy for commits.
#[derive(Debug, Clone, Copy)]
pub struct CommitBatcher {
    threshold: usize,
}

impl CommitBatcher {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether `uncommitted` pending ids warrant a commit for `role`.
    pub fn should_commit(&self, role: &Role, uncommitted: usize) -> bool {
        role.owner_capability().is_some() && uncommitted >= self.threshold
    }

    /// Snapshot the document, upload it and register it with the relay.
    ///
    /// Returns the content identifier of the uploaded snapshot.
    pub async fn commit<R: CommitRegistrar + ?Sized>(
        &self,
        role: &Role,
        key: &RoomKey,
        doc: &SharedDoc,
        store: &dyn ContentStore,
        registrar: &R,
        update_ids: Vec<UpdateId>,
    ) -> Result<ContentId, SyncError> {
        let owner = role.owner_capability().ok_or(CommitError::NotOwner)?;

        let sealed = seal_snapshot(key, doc)?;
        let size = sealed.len();
        let content_id = store.upload(sealed).await?;
        log::debug!("Uploaded snapshot {content_id} ({size} bytes)");

        let count = update_ids.len();
        registrar
            .register_commit(owner, update_ids, content_id.clone())
            .await?;
        log::info!("Committed {count} updates as {content_id}");
        Ok(content_id)
    }
}

/// Compress and encrypt the full document state.
pub fn seal_snapshot(key: &RoomKey, doc: &SharedDoc) -> Result<Vec<u8>, SyncError> {
    let state = doc.encode_full_state();
    let compressed = lz4_flex::compress_prepend_size(&state);
    Ok(crypto::encrypt(key, &compressed)?)
}

/// Decrypt and decompress a snapshot produced by [`seal_snapshot`].
pub fn open_snapshot(key: &RoomKey, sealed: &[u8]) -> Result<Vec<u8>, SyncError> {
    let compressed = crypto::decrypt(key, sealed)?;
    lz4_flex::decompress_size_prepended(&compressed)
        .map_err(|e| SyncError::Document(format!("corrupt snapshot: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentStore;
    use crate::document::UpdateOrigin;
    use std::sync::Mutex;
    use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

    #[derive(Default)]
    struct RecordingRegistrar {
        calls: Mutex<Vec<(Vec<UpdateId>, ContentId)>>,
        reject: bool,
    }

    impl CommitRegistrar for RecordingRegistrar {
        fn register_commit<'a>(
            &'a self,
            _owner: &'a OwnerCapability,
            update_ids: Vec<UpdateId>,
            content_id: ContentId,
        ) -> BoxFuture<'a, Result<(), SyncError>> {
            Box::pin(async move {
                if self.reject {
                    return Err(CommitError::Rejected { code: 403, message: "no".into() }.into());
                }
                self.calls.lock().unwrap().push((update_ids, content_id));
                Ok(())
            })
        }
    }

    fn doc_with(text: &str) -> SharedDoc {
        let doc = SharedDoc::new();
        {
            let mut txn = doc.doc().transact_mut();
            let t = txn.get_or_insert_text("content");
            t.insert(&mut txn, 0, text);
        }
        doc
    }

    fn owner() -> Role {
        Role::Owner(OwnerCapability::from_seed([4u8; 32]))
    }

    #[test]
    fn test_threshold_owner_only() {
        let batcher = CommitBatcher::new(10);
        assert!(!batcher.should_commit(&owner(), 9));
        assert!(batcher.should_commit(&owner(), 10));
        assert!(batcher.should_commit(&owner(), 11));
        assert!(!batcher.should_commit(&Role::Editor, 50));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let key = RoomKey::generate();
        let doc = doc_with("persist me");
        let sealed = seal_snapshot(&key, &doc).unwrap();

        let restored = SharedDoc::new();
        let state = open_snapshot(&key, &sealed).unwrap();
        restored.apply_update(&state, UpdateOrigin::Remote).unwrap();

        let txn = restored.doc().transact();
        assert_eq!(txn.get_text("content").unwrap().get_string(&txn), "persist me");
    }

    #[test]
    fn test_snapshot_wrong_key_is_crypto_error() {
        let sealed = seal_snapshot(&RoomKey::generate(), &doc_with("x")).unwrap();
        assert!(matches!(
            open_snapshot(&RoomKey::generate(), &sealed),
            Err(SyncError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_uploads_and_registers() {
        let key = RoomKey::generate();
        let store = MemoryContentStore::new();
        let registrar = RecordingRegistrar::default();
        let ids: Vec<UpdateId> = (1..=10).map(UpdateId).collect();

        let content_id = CommitBatcher::new(10)
            .commit(&owner(), &key, &doc_with("abc"), &store, &registrar, ids.clone())
            .await
            .unwrap();

        let calls = registrar.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (ids, content_id.clone()));
        assert!(store.fetch(&content_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_editor_cannot_commit() {
        let registrar = RecordingRegistrar::default();
        let result = CommitBatcher::new(10)
            .commit(
                &Role::Editor,
                &RoomKey::generate(),
                &SharedDoc::new(),
                &MemoryContentStore::new(),
                &registrar,
                vec![UpdateId(1)],
            )
            .await;
        assert_eq!(result, Err(SyncError::Commit(CommitError::NotOwner)));
        assert!(registrar.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_commit_propagates() {
        let registrar = RecordingRegistrar { reject: true, ..Default::default() };
        let result = CommitBatcher::new(10)
            .commit(
                &owner(),
                &RoomKey::generate(),
                &SharedDoc::new(),
                &MemoryContentStore::new(),
                &registrar,
                vec![UpdateId(1)],
            )
            .await;
        assert!(matches!(result, Err(SyncError::Commit(CommitError::Rejected { .. }))));
    }
}
