//! Error taxonomy for the sync engine.
//!
//! Every layer has its own error enum; [`SyncError`] is the umbrella the
//! transport and session driver return. Transient variants are retried by
//! the state machine up to the configured budget.

use thiserror::Error;

use crate::protocol::StatusCode;

/// Symmetric-crypto failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Ciphertext too short: {0} bytes")]
    Truncated(usize),
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed (wrong room key or tampered payload)")]
    Decrypt,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Capability-token failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed token: {0}")]
    Malformed(String),
    #[error("Invalid token signature")]
    BadSignature,
    #[error("Token expired at {0}")]
    Expired(u64),
    #[error("Token audience mismatch: expected {expected}, got {actual}")]
    WrongAudience { expected: String, actual: String },
    #[error("Token is scoped to room {actual}, not {expected}")]
    WrongRoom { expected: String, actual: String },
    #[error("Token lacks the {0} capability")]
    MissingCapability(&'static str),
}

/// Wire-format failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected reply payload for {0}")]
    UnexpectedReply(&'static str),
    #[error("Unexpected frame during {0}")]
    UnexpectedFrame(&'static str),
}

/// Snapshot upload or server-side commit rejection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error("Snapshot upload failed: {0}")]
    Upload(String),
    #[error("Content {0} not found")]
    NotFound(String),
    #[error("Server rejected commit ({code}): {message}")]
    Rejected { code: StatusCode, message: String },
    #[error("Commit requires the owner role")]
    NotOwner,
}

/// Umbrella error for transport and session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Handshake rejected ({code}): {message}")]
    Handshake { code: StatusCode, message: String },
    #[error("Not connected")]
    NotConnected,
    #[error("Request failed ({code}): {message}")]
    Rejected { code: StatusCode, message: String },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Document error: {0}")]
    Document(String),
}

impl SyncError {
    /// Whether the failure came from the network layer rather than from
    /// payload content.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_) | SyncError::NotConnected | SyncError::Handshake { .. }
        )
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
