//! Content-addressed snapshot storage.
//!
//! Commits upload an encrypted full-document snapshot through a host-supplied
//! store and register the returned identifier with the relay. Joining clients
//! fetch the snapshot back by that identifier.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;

use crate::error::CommitError;
use crate::protocol::ContentId;

/// Host-supplied upload/fetch pair (e.g. an IPFS gateway).
pub trait ContentStore: Send + Sync + 'static {
    /// Store `data`, returning its content identifier.
    fn upload(&self, data: Vec<u8>) -> BoxFuture<'_, Result<ContentId, CommitError>>;

    /// Retrieve bytes previously stored under `id`.
    fn fetch(&self, id: &ContentId) -> BoxFuture<'_, Result<Vec<u8>, CommitError>>;
}

/// Content identifier for `data`: blake3 digest, hex encoded.
pub fn content_id_for(data: &[u8]) -> ContentId {
    ContentId(blake3::hash(data).to_hex().to_string())
}

/// In-process store keyed by blake3 digest.
///
/// Clones share the same blobs, so several sessions in one process (tests,
/// local demos) see each other's snapshots.
#[derive(Debug, Clone, Default)]
pub struct MemoryContentStore {
    blobs: Arc<RwLock<HashMap<ContentId, Vec<u8>>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for MemoryContentStore {
    fn upload(&self, data: Vec<u8>) -> BoxFuture<'_, Result<ContentId, CommitError>> {
        Box::pin(async move {
            let id = content_id_for(&data);
            let mut blobs = self
                .blobs
                .write()
                .map_err(|e| CommitError::Upload(e.to_string()))?;
            blobs.insert(id.clone(), data);
            Ok(id)
        })
    }

    fn fetch(&self, id: &ContentId) -> BoxFuture<'_, Result<Vec<u8>, CommitError>> {
        let id = id.clone();
        Box::pin(async move {
            let blobs = self
                .blobs
                .read()
                .map_err(|e| CommitError::Upload(e.to_string()))?;
            blobs
                .get(&id)
                .cloned()
                .ok_or(CommitError::NotFound(id.0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_then_fetch() {
        let store = MemoryContentStore::new();
        let id = store.upload(vec![1, 2, 3]).await.unwrap();
        assert_eq!(id, content_id_for(&[1, 2, 3]));
        assert_eq!(store.fetch(&id).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_same_content_same_id() {
        let store = MemoryContentStore::new();
        let a = store.upload(b"snapshot".to_vec()).await.unwrap();
        let b = store.upload(b"snapshot".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_missing() {
        let store = MemoryContentStore::new();
        let missing = ContentId("nope".into());
        assert_eq!(
            store.fetch(&missing).await,
            Err(CommitError::NotFound("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_clones_share_blobs() {
        let store = MemoryContentStore::new();
        let other = store.clone();
        let id = store.upload(vec![5]).await.unwrap();
        assert_eq!(other.fetch(&id).await.unwrap(), vec![5]);
    }
}
