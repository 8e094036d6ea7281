//! Replicated document adapter over a yrs `Doc`.
//!
//! The engine treats the CRDT as an opaque merge primitive. It needs four
//! things from it: apply an update, encode the full state, merge several
//! updates into one, and observe updates together with their origin so that
//! remotely-applied changes are never echoed back to the relay.

use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::error::SyncError;

/// Transaction origin used for every update applied on behalf of a peer.
const REMOTE_ORIGIN: &str = "logos-sync/remote";

/// Who produced an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

/// An update observed on the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdate {
    pub origin: UpdateOrigin,
    /// yrs v1 update bytes
    pub update: Vec<u8>,
}

/// Live subscription to document updates. Dropping it unsubscribes.
pub struct DocUpdates {
    rx: mpsc::UnboundedReceiver<DocUpdate>,
    _subscription: Subscription,
}

impl DocUpdates {
    pub async fn recv(&mut self) -> Option<DocUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DocUpdate> {
        self.rx.try_recv().ok()
    }
}

/// Shared handle to the replicated document.
///
/// Cloning is cheap; all clones refer to the same yrs document.
#[derive(Clone)]
pub struct SharedDoc {
    doc: Doc,
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDoc {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Wrap an existing yrs document (the host keeps editing it directly).
    pub fn from_doc(doc: Doc) -> Self {
        Self { doc }
    }

    /// The underlying yrs document, for local edits by the host.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Apply a v1 update, tagging the transaction with `origin`.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), SyncError> {
        let update = Update::decode_v1(update).map_err(|e| SyncError::Document(e.to_string()))?;
        let mut txn = match origin {
            UpdateOrigin::Remote => self.doc.transact_mut_with(REMOTE_ORIGIN),
            UpdateOrigin::Local => self.doc.transact_mut(),
        };
        txn.apply_update(update)
            .map_err(|e| SyncError::Document(e.to_string()))?;
        Ok(())
    }

    /// Encode the complete document state as a single v1 update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Subscribe to updates with their origin.
    pub fn subscribe(&self) -> Result<DocUpdates, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .doc
            .observe_update_v1(move |txn, event| {
                let origin = match txn.origin() {
                    Some(origin) if *origin == Origin::from(REMOTE_ORIGIN) => UpdateOrigin::Remote,
                    _ => UpdateOrigin::Local,
                };
                let _ = tx.send(DocUpdate {
                    origin,
                    update: event.update.clone(),
                });
            })
            .map_err(|e| SyncError::Document(e.to_string()))?;
        Ok(DocUpdates {
            rx,
            _subscription: subscription,
        })
    }
}

/// Merge several v1 updates into one equivalent update.
pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>, SyncError> {
    if updates.len() == 1 {
        return Ok(updates[0].clone());
    }
    let refs: Vec<&[u8]> = updates.iter().map(|u| u.as_slice()).collect();
    yrs::merge_updates_v1(&refs).map_err(|e| SyncError::Document(e.to_string()))
}
