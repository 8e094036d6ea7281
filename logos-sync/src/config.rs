//! Session configuration.

use std::time::Duration;

/// Uncommitted update count that triggers an owner commit.
pub const DEFAULT_COMMIT_THRESHOLD: usize = 10;
/// Consecutive step failures tolerated before giving up on a session.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Minimum spacing between two awareness broadcasts.
pub const DEFAULT_AWARENESS_DEBOUNCE: Duration = Duration::from_millis(100);
/// Lifetime of a freshly minted capability token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);
/// Tokens closer than this to expiry are rebuilt before use.
pub const DEFAULT_TOKEN_REFRESH_BUFFER: Duration = Duration::from_secs(60);

/// Client-side sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Relay base URL; the room id is appended as the last path segment
    pub server_url: String,
    /// Display name announced to other members
    pub display_name: String,
    /// Uncommitted-id count at which the owner commits
    pub commit_threshold: usize,
    /// Shared retry budget for connect/catch-up/send/commit failures
    pub max_retries: u32,
    /// Awareness debounce window
    pub awareness_debounce: Duration,
    /// Capability token lifetime
    pub token_ttl: Duration,
    /// Safety buffer before token expiry
    pub token_refresh_buffer: Duration,
    /// Websocket connect + handshake timeout
    pub connect_timeout: Duration,
    /// Upper bound on waiting for an acknowledged call
    pub request_timeout: Duration,
    /// Capacity of the host event channel
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            display_name: "Anonymous".to_string(),
            commit_threshold: DEFAULT_COMMIT_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            awareness_debounce: DEFAULT_AWARENESS_DEBOUNCE,
            token_ttl: DEFAULT_TOKEN_TTL,
            token_refresh_buffer: DEFAULT_TOKEN_REFRESH_BUFFER,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Default configuration pointed at `server_url`.
    pub fn new(server_url: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Websocket URL for a room.
    pub fn room_url(&self, room_id: &str) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.commit_threshold, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.awareness_debounce, Duration::from_millis(100));
        assert_eq!(config.token_ttl, Duration::from_secs(3600));
        assert_eq!(config.token_refresh_buffer, Duration::from_secs(60));
    }

    #[test]
    fn test_room_url() {
        let config = SyncConfig::new("ws://localhost:9090/", "Alice");
        assert_eq!(config.room_url("room-1"), "ws://localhost:9090/room-1");
        assert_eq!(config.display_name, "Alice");
    }
}
