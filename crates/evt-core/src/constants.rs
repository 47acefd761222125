//! Protocol and configuration constants for everterm.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Default server port.
pub const DEFAULT_PORT: u16 = 2022;

/// Maximum frame length accepted on the wire (type byte + payload).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Session passkey length in bytes.
pub const PASSKEY_LEN: usize = 32;

// =============================================================================
// Timing Constants
// =============================================================================

/// Idle interval after which the client emits a keepalive probe.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);

/// Bounded wait of the engine's readiness multiplex.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Timeout for a single transport connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum spacing between reconnect attempts while disconnected.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout for dialing a reverse-tunnel target on localhost.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Limits
// =============================================================================

/// Consecutive connect timeouts before the session is declared dead.
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Bound on the replay queue of unacknowledged frames.
pub const MAX_REPLAY_BYTES: usize = 16 * 1024 * 1024;

// =============================================================================
// Buffer Sizes
// =============================================================================

/// Console reads are chunked to this size per loop iteration.
pub const CONSOLE_BUF_SIZE: usize = 16 * 1024;

/// Buffer size for forwarded connection data.
pub const FORWARD_BUFFER_SIZE: usize = 64 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_is_shorter_than_keepalive() {
        assert!(POLL_INTERVAL < KEEPALIVE_PERIOD);
    }

    #[test]
    fn forward_chunks_fit_in_a_frame() {
        assert!(FORWARD_BUFFER_SIZE < MAX_FRAME_SIZE);
        assert!(CONSOLE_BUF_SIZE < MAX_FRAME_SIZE);
    }

    #[test]
    fn passkey_is_256_bits() {
        assert_eq!(PASSKEY_LEN, 32);
    }
}
