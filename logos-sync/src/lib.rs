//! # logos-sync: End-to-end encrypted collaborative document sync
//!
//! Keeps a yrs document consistent across collaborators through a relay
//! that only ever sees ciphertext.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  local deltas   ┌──────────────┐   Binary Proto   ┌─────────────┐
//! │ SharedDoc    │ ──────────────► │ SyncSession  │ ◄──────────────► │ SyncServer  │
//! │ (yrs)        │ ◄────────────── │ (machine +   │    WebSocket     │ (relay)     │
//! └──────────────┘  remote deltas  │  driver)     │                  └──────┬──────┘
//!                                  └──────┬───────┘                         │
//!                                         │ snapshots               ┌───────┴───────┐
//!                                         ▼                         │ BroadcastGroup│
//!                                  ┌──────────────┐                 │ (fan-out)     │
//!                                  │ ContentStore │                 └───────────────┘
//!                                  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Room keys and XChaCha20-Poly1305 sealing
//! - [`auth`]: Capability tokens, session identity, owner capability
//! - [`protocol`]: Binary wire protocol (bincode-encoded Frame)
//! - [`transport`]: WebSocket RPC client with event routing
//! - [`awareness`]: Encrypted, debounced presence channel
//! - [`commit`]: Owner-side snapshot batching
//! - [`machine`]: Pure sync state machine
//! - [`session`]: Async driver wiring the machine to the document
//! - [`server`]: Relay server
//! - [`broadcast`]: Room-based fan-out on the relay

pub mod auth;
pub mod awareness;
pub mod broadcast;
pub mod commit;
pub mod config;
pub mod content;
pub mod crypto;
pub mod document;
pub mod error;
pub mod machine;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use auth::{Capability, CapabilityToken, OwnerCapability, Role, SessionIdentity, TokenCache};
pub use awareness::{
    AwarenessChannel, AwarenessMessage, AwarenessState, CursorColor, CursorRange, PresenceRegistry,
};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use commit::{CommitBatcher, CommitRegistrar};
pub use config::SyncConfig;
pub use content::{ContentStore, MemoryContentStore};
pub use crypto::RoomKey;
pub use document::{SharedDoc, UpdateOrigin};
pub use error::{AuthError, CommitError, CryptoError, ProtocolError, Result, SyncError};
pub use machine::{ConnectionStatus, SyncEvent, SyncMachine, SyncState};
pub use protocol::{ContentId, MemberRole, RoomMember, UpdateId};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{SessionEvent, SessionHandle, SyncSession};
pub use transport::{ConnectionState, RoomInfo, TransportClient, TransportEvent};
