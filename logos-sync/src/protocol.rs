//! Binary RPC protocol between sync clients and the relay.
//!
//! Every websocket binary message is one bincode-encoded [`Frame`]:
//!
//! ```text
//! Client                                   Relay
//!   │ ◄──────── Event(Challenge{server_identity})
//!   │ ─────────► Request{id, Handshake{..}}
//!   │ ◄──────── Response{id, Reply{status, status_code, data}}
//!   │ ─────────► Request{id, SendUpdate{..}}      (acknowledged)
//!   │ ─────────► Request{id, BroadcastAwareness}  (no reply)
//!   │ ◄──────── Event(Update | Awareness | MembershipChanged | ...)
//! ```
//!
//! Payloads that carry document or presence content are ciphertext; the
//! relay never sees plaintext.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::CapabilityToken;
use crate::error::ProtocolError;

/// HTTP-style status code carried in every reply.
pub type StatusCode = u16;

pub const STATUS_OK: StatusCode = 200;
pub const STATUS_BAD_REQUEST: StatusCode = 400;
pub const STATUS_UNAUTHORIZED: StatusCode = 401;
pub const STATUS_FORBIDDEN: StatusCode = 403;
pub const STATUS_NOT_FOUND: StatusCode = 404;
pub const STATUS_CONFLICT: StatusCode = 409;

/// Server-assigned identifier of an update record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateId(pub u64);

impl std::fmt::Display for UpdateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Content identifier of an uploaded snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentId(pub String);

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An encrypted delta accepted by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: UpdateId,
    /// Ciphertext of a yrs v1 update
    pub data: Vec<u8>,
}

/// A durable snapshot plus the update ids it supersedes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub content_id: ContentId,
    pub update_ids: Vec<UpdateId>,
    /// Seconds since epoch (relay clock)
    pub created_at: u64,
}

/// Role of a room participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Owner,
    Editor,
}

/// A participant in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub peer_id: Uuid,
    pub name: String,
    pub role: MemberRole,
}

impl RoomMember {
    pub fn new(name: impl Into<String>, role: MemberRole) -> Self {
        Self::with_id(Uuid::new_v4(), name, role)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>, role: MemberRole) -> Self {
        Self {
            peer_id,
            name: name.into(),
            role,
        }
    }
}

/// Handshake request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Collaborate-scoped token signed by the session identity
    pub token: CapabilityToken,
    /// Hex ed25519 public key derived from the room key
    pub session_identity: String,
    pub room_id: String,
    pub member: RoomMember,
    /// Own-scoped token, present for owner sessions only
    pub owner_token: Option<CapabilityToken>,
    /// Hex public key of the owner credential
    pub owner_address: Option<String>,
    /// Encrypted room metadata, stored by the relay on first join
    pub room_info: Option<Vec<u8>>,
}

/// Client → relay calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Handshake(HandshakePayload),
    SendUpdate {
        data: Vec<u8>,
    },
    CommitUpdates {
        update_ids: Vec<UpdateId>,
        content_id: ContentId,
        owner_token: CapabilityToken,
    },
    FetchLatestCommit,
    FetchUncommittedChanges,
    /// Unacknowledged
    BroadcastAwareness {
        data: Vec<u8>,
    },
    FetchPeers,
    TerminateSession {
        owner_token: CapabilityToken,
    },
}

impl Request {
    /// Whether the relay answers this call with a [`Reply`].
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, Request::BroadcastAwareness { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Handshake(_) => "handshake",
            Request::SendUpdate { .. } => "send-update",
            Request::CommitUpdates { .. } => "commit-updates",
            Request::FetchLatestCommit => "fetch-latest-commit",
            Request::FetchUncommittedChanges => "fetch-uncommitted-changes",
            Request::BroadcastAwareness { .. } => "broadcast-awareness",
            Request::FetchPeers => "fetch-peer-list",
            Request::TerminateSession { .. } => "terminate-session",
        }
    }
}

/// Typed reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyData {
    None,
    Message(String),
    RoomInfo(Option<Vec<u8>>),
    UpdateId(UpdateId),
    Commit(Option<CommitRecord>),
    Updates(Vec<UpdateRecord>),
    Peers(Vec<RoomMember>),
}

/// Acknowledgement shape shared by every acknowledged call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: bool,
    pub status_code: StatusCode,
    pub data: ReplyData,
}

impl Reply {
    pub fn ok(data: ReplyData) -> Self {
        Self {
            status: true,
            status_code: STATUS_OK,
            data,
        }
    }

    pub fn error(status_code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: false,
            status_code,
            data: ReplyData::Message(message.into()),
        }
    }

    /// Error text carried by a failed reply.
    pub fn message(&self) -> String {
        match &self.data {
            ReplyData::Message(m) => m.clone(),
            other => format!("{other:?}"),
        }
    }
}

/// Relay → client notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// First frame of every connection
    Challenge { server_identity: String },
    /// A peer's update, already stored by the relay
    Update(UpdateRecord),
    /// A peer's encrypted awareness payload
    Awareness { peer_id: Uuid, data: Vec<u8> },
    /// Someone joined or left; clients refetch the roster
    MembershipChanged,
    /// The owner closed the room
    SessionTerminated,
}

/// Top-level wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Request { id: u64, call: Request },
    Response { id: u64, reply: Reply },
    Event(ServerEvent),
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_update_frame() {
        let frame = Frame::Request {
            id: 7,
            call: Request::SendUpdate { data: vec![1, 2, 3] },
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        match decoded {
            Frame::Request { id, call: Request::SendUpdate { data } } => {
                assert_eq!(id, 7);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_reply_frame_keeps_records() {
        let records = vec![
            UpdateRecord { id: UpdateId(1), data: vec![9; 40] },
            UpdateRecord { id: UpdateId(2), data: vec![] },
        ];
        let frame = Frame::Response {
            id: 3,
            reply: Reply::ok(ReplyData::Updates(records.clone())),
        };
        match Frame::decode(&frame.encode().unwrap()).unwrap() {
            Frame::Response { reply, .. } => {
                assert!(reply.status);
                assert_eq!(reply.status_code, STATUS_OK);
                assert_eq!(reply.data, ReplyData::Updates(records));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_error_reply_message() {
        let reply = Reply::error(STATUS_FORBIDDEN, "owner only");
        assert!(!reply.status);
        assert_eq!(reply.status_code, 403);
        assert_eq!(reply.message(), "owner only");
    }

    #[test]
    fn test_awareness_is_unacknowledged() {
        assert!(!Request::BroadcastAwareness { data: vec![] }.is_acknowledged());
        assert!(Request::FetchPeers.is_acknowledged());
        assert!(Request::FetchLatestCommit.is_acknowledged());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(Frame::decode(&garbage).is_err());
    }

    #[test]
    fn test_update_id_display() {
        assert_eq!(UpdateId(12).to_string(), "u12");
        assert_eq!(ContentId("abc".into()).to_string(), "abc");
    }

    #[test]
    fn test_member_with_id() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let member = RoomMember::with_id(id, "Alice", MemberRole::Owner);
        assert_eq!(member.peer_id, id);
        assert_eq!(member.role, MemberRole::Owner);
    }
}
