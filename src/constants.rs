//! Application-wide constants for durcit-sync.
//!
//! Timeouts, backoff bounds, and wire defaults live here so the state
//! machine and the transports agree on them.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for REST calls (bulk fetch, confirm, logout).
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a connection attempt may stay in `Connecting` before the
/// subscribe is considered lost and the attempt fails.
pub const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Reconnect backoff
// ============================================================================

/// First retry delay after a failed attempt.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the retry delay. Retries never stop while an identity
/// is present, so this is the minimum spacing of attempts in steady failure.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

// ============================================================================
// Wire defaults
// ============================================================================

/// REST API base URL.
pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Raw WebSocket endpoint of the SockJS `/ws` server.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws/websocket";

/// Per-member push destination prefix; the member id is appended.
pub const DEFAULT_CHANNEL_PREFIX: &str = "/topic/pushs/";

/// Broadcast topic carrying emoji reaction updates for every post.
pub const DEFAULT_EMOJI_TOPIC: &str = "/topic/emojiUpdate";

/// Application destination for emoji reactions.
pub const ADD_EMOJI_DESTINATION: &str = "/app/addEmoji";

/// Name of the shared credential file inside the config directory.
pub const CREDENTIALS_FILE: &str = "credentials.json";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds_are_ordered() {
        assert!(INITIAL_BACKOFF < MAX_BACKOFF);
        assert!(INITIAL_BACKOFF >= Duration::from_millis(500));
    }

    #[test]
    fn test_timeout_values_are_reasonable() {
        assert!(HTTP_REQUEST_TIMEOUT >= Duration::from_secs(5));
        assert!(HTTP_REQUEST_TIMEOUT <= Duration::from_secs(60));
        assert!(SUBSCRIBE_ACK_TIMEOUT > Duration::ZERO);
    }

    #[test]
    fn test_channel_prefix_ends_with_separator() {
        assert!(DEFAULT_CHANNEL_PREFIX.ends_with('/'));
    }
}
