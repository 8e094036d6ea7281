//! Capability tokens and session roles.
//!
//! A session presents two kinds of ed25519-signed, time-boxed tokens:
//!
//! - **Collaborate**, signed by the session identity derived from the room
//!   key. Every member of a room derives the same identity, so a valid
//!   signature proves knowledge of the key.
//! - **Own**, signed by the owner credential. Only owner sessions hold one;
//!   it scopes commit and terminate calls.
//!
//! Tokens are bound to the relay's identity (audience) and the room id.

use std::time::Duration;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto::RoomKey;
use crate::error::{AuthError, CryptoError};
use crate::protocol::{unix_now, MemberRole};

/// What a token allows its bearer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    Collaborate,
    Own,
}

impl Capability {
    fn label(self) -> &'static str {
        match self {
            Capability::Collaborate => "collaborate",
            Capability::Own => "own",
        }
    }
}

/// Signed token body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Hex public key of the signer
    pub issuer: String,
    /// Identity of the relay the token is meant for
    pub audience: String,
    pub room_id: String,
    pub capability: Capability,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl TokenClaims {
    fn signing_bytes(&self) -> Result<Vec<u8>, AuthError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| AuthError::Malformed(e.to_string()))
    }
}

/// A signed capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub claims: TokenClaims,
    pub signature: Vec<u8>,
}

impl CapabilityToken {
    /// Mint a token valid for `ttl` from now.
    pub fn issue(
        key: &SigningKey,
        audience: &str,
        room_id: &str,
        capability: Capability,
        ttl: Duration,
    ) -> Result<Self, AuthError> {
        let issued_at = unix_now();
        let claims = TokenClaims {
            issuer: hex::encode(key.verifying_key().to_bytes()),
            audience: audience.to_string(),
            room_id: room_id.to_string(),
            capability,
            issued_at,
            expires_at: issued_at + ttl.as_secs(),
        };
        let signature = key.sign(&claims.signing_bytes()?).to_bytes().to_vec();
        Ok(Self { claims, signature })
    }

    /// Check signature, audience, room, capability and expiry.
    pub fn verify(
        &self,
        audience: &str,
        room_id: &str,
        capability: Capability,
        now: u64,
    ) -> Result<(), AuthError> {
        let issuer = parse_public_key(&self.claims.issuer)?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        issuer
            .verify(&self.claims.signing_bytes()?, &signature)
            .map_err(|_| AuthError::BadSignature)?;

        if self.claims.audience != audience {
            return Err(AuthError::WrongAudience {
                expected: audience.to_string(),
                actual: self.claims.audience.clone(),
            });
        }
        if self.claims.room_id != room_id {
            return Err(AuthError::WrongRoom {
                expected: room_id.to_string(),
                actual: self.claims.room_id.clone(),
            });
        }
        if self.claims.capability != capability {
            return Err(AuthError::MissingCapability(capability.label()));
        }
        if now >= self.claims.expires_at {
            return Err(AuthError::Expired(self.claims.expires_at));
        }
        Ok(())
    }

    /// Whether the token is still usable `buffer` from now.
    pub fn is_fresh(&self, now: u64, buffer: Duration) -> bool {
        now + buffer.as_secs() < self.claims.expires_at
    }
}

/// Decode a hex ed25519 public key.
pub fn parse_public_key(text: &str) -> Result<VerifyingKey, AuthError> {
    let raw = hex::decode(text).map_err(|e| AuthError::Malformed(e.to_string()))?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| AuthError::Malformed("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| AuthError::Malformed(e.to_string()))
}

/// Session identity derived from the room key.
#[derive(Clone)]
pub struct SessionIdentity {
    key: SigningKey,
}

impl SessionIdentity {
    pub fn from_room_key(room_key: &RoomKey) -> Result<Self, CryptoError> {
        Ok(Self {
            key: room_key.signing_key()?,
        })
    }

    /// Hex public key presented to the relay.
    pub fn public_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }
}

/// Credential that elevates a session to room owner.
///
/// Only obtainable through [`Role::Owner`], so commit and terminate paths
/// must match on the role to reach it.
#[derive(Clone)]
pub struct OwnerCapability {
    key: SigningKey,
}

impl OwnerCapability {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Owner credential from raw seed bytes.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(&seed))
    }

    /// Hex public key announced as the room's owner address.
    pub fn address(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }
}

impl std::fmt::Debug for OwnerCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerCapability")
            .field("address", &self.address())
            .finish()
    }
}

/// Capability-scoped session role.
#[derive(Debug, Clone)]
pub enum Role {
    Owner(OwnerCapability),
    Editor,
}

impl Role {
    pub fn owner_capability(&self) -> Option<&OwnerCapability> {
        match self {
            Role::Owner(cap) => Some(cap),
            Role::Editor => None,
        }
    }

    pub fn member_role(&self) -> MemberRole {
        match self {
            Role::Owner(_) => MemberRole::Owner,
            Role::Editor => MemberRole::Editor,
        }
    }
}

/// Caches minted tokens and rebuilds them inside the safety buffer.
#[derive(Debug, Clone)]
pub struct TokenCache {
    ttl: Duration,
    refresh_buffer: Duration,
    collaborate: Option<CapabilityToken>,
    own: Option<CapabilityToken>,
}

impl TokenCache {
    pub fn new(ttl: Duration, refresh_buffer: Duration) -> Self {
        Self {
            ttl,
            refresh_buffer,
            collaborate: None,
            own: None,
        }
    }

    /// Valid collaborate token for `audience`, minting a new one if needed.
    pub fn collaborate(
        &mut self,
        identity: &SessionIdentity,
        audience: &str,
        room_id: &str,
    ) -> Result<CapabilityToken, AuthError> {
        let (ttl, buffer) = (self.ttl, self.refresh_buffer);
        Self::fresh_or_issue(
            &mut self.collaborate,
            identity.signing_key(),
            audience,
            room_id,
            Capability::Collaborate,
            ttl,
            buffer,
        )
    }

    /// Valid owner token for `audience`, minting a new one if needed.
    pub fn own(
        &mut self,
        owner: &OwnerCapability,
        audience: &str,
        room_id: &str,
    ) -> Result<CapabilityToken, AuthError> {
        let (ttl, buffer) = (self.ttl, self.refresh_buffer);
        Self::fresh_or_issue(
            &mut self.own,
            owner.signing_key(),
            audience,
            room_id,
            Capability::Own,
            ttl,
            buffer,
        )
    }

    fn fresh_or_issue(
        slot: &mut Option<CapabilityToken>,
        key: &SigningKey,
        audience: &str,
        room_id: &str,
        capability: Capability,
        ttl: Duration,
        buffer: Duration,
    ) -> Result<CapabilityToken, AuthError> {
        if let Some(token) = slot {
            if token.claims.audience == audience && token.is_fresh(unix_now(), buffer) {
                return Ok(token.clone());
            }
            log::debug!("Rebuilding {} token (expiring or new audience)", capability.label());
        }
        let token = CapabilityToken::issue(key, audience, room_id, capability, ttl)?;
        *slot = Some(token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SessionIdentity {
        SessionIdentity::from_room_key(&RoomKey::from_bytes([3u8; 32])).unwrap()
    }

    #[test]
    fn test_token_verifies() {
        let id = identity();
        let token = CapabilityToken::issue(
            id.signing_key(),
            "relay",
            "room",
            Capability::Collaborate,
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(token.claims.issuer, id.public_hex());
        token.verify("relay", "room", Capability::Collaborate, unix_now()).unwrap();
    }

    #[test]
    fn test_token_rejections() {
        let id = identity();
        let token = CapabilityToken::issue(
            id.signing_key(),
            "relay",
            "room",
            Capability::Collaborate,
            Duration::from_secs(60),
        )
        .unwrap();
        let now = unix_now();

        assert!(matches!(
            token.verify("other", "room", Capability::Collaborate, now),
            Err(AuthError::WrongAudience { .. })
        ));
        assert!(matches!(
            token.verify("relay", "room-2", Capability::Collaborate, now),
            Err(AuthError::WrongRoom { .. })
        ));
        assert_eq!(
            token.verify("relay", "room", Capability::Own, now),
            Err(AuthError::MissingCapability("own"))
        );
        assert!(matches!(
            token.verify("relay", "room", Capability::Collaborate, now + 61),
            Err(AuthError::Expired(_))
        ));
    }

    #[test]
    fn test_tampered_claims_fail_signature() {
        let id = identity();
        let mut token = CapabilityToken::issue(
            id.signing_key(),
            "relay",
            "room",
            Capability::Collaborate,
            Duration::from_secs(60),
        )
        .unwrap();
        token.claims.capability = Capability::Own;
        assert_eq!(
            token.verify("relay", "room", Capability::Own, unix_now()),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn test_token_cache_reuses_fresh_token() {
        let id = identity();
        let mut cache = TokenCache::new(Duration::from_secs(3600), Duration::from_secs(60));
        let a = cache.collaborate(&id, "relay", "room").unwrap();
        let b = cache.collaborate(&id, "relay", "room").unwrap();
        assert_eq!(a, b);

        // New audience forces a rebuild.
        let c = cache.collaborate(&id, "relay-2", "room").unwrap();
        assert_eq!(c.claims.audience, "relay-2");
    }

    #[test]
    fn test_token_cache_rebuilds_inside_buffer() {
        let id = identity();
        // ttl shorter than the buffer: every token is already stale
        let mut cache = TokenCache::new(Duration::from_secs(30), Duration::from_secs(60));
        let a = cache.collaborate(&id, "relay", "room").unwrap();
        assert!(!a.is_fresh(unix_now(), Duration::from_secs(60)));
        let b = cache.collaborate(&id, "relay", "room").unwrap();
        b.verify("relay", "room", Capability::Collaborate, unix_now()).unwrap();
    }

    #[test]
    fn test_owner_token_scoped_to_own() {
        let owner = OwnerCapability::from_seed([9u8; 32]);
        let mut cache = TokenCache::new(Duration::from_secs(3600), Duration::from_secs(60));
        let token = cache.own(&owner, "relay", "room").unwrap();
        assert_eq!(token.claims.issuer, owner.address());
        token.verify("relay", "room", Capability::Own, unix_now()).unwrap();
    }

    #[test]
    fn test_role_capability() {
        let owner = Role::Owner(OwnerCapability::from_seed([1u8; 32]));
        assert!(owner.owner_capability().is_some());
        assert_eq!(owner.member_role(), MemberRole::Owner);
        assert!(Role::Editor.owner_capability().is_none());
        assert_eq!(Role::Editor.member_role(), MemberRole::Editor);
    }

    #[test]
    fn test_parse_public_key_errors() {
        assert!(parse_public_key("not-hex").is_err());
        assert!(parse_public_key("abcd").is_err());
        assert!(parse_public_key(&identity().public_hex()).is_ok());
    }
}
