//! Protocol definitions and constants

use thiserror::Error;

/// Protocol errors. Every variant is fatal to the session that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Frame integrity check failed")]
    DecryptFailed,

    #[error("Stale frame timestamp (skew {skew}s)")]
    StaleTimestamp { skew: i64 },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Unknown command: {0:#04x}")]
    UnknownCommand(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Accepted clock skew between peers in seconds
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 180;

/// Maximum plaintext payload carried by one PSH frame (32 KB)
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;

/// Keepalive interval in seconds
pub const KEEPALIVE_INTERVAL: u64 = 10;

/// Close a session after this many seconds without any inbound frame
pub const KEEPALIVE_TIMEOUT: u64 = 30;

/// Pending inbound streams queued before the receive loop waits on `accept`
pub const DEFAULT_ACCEPT_BACKLOG: usize = 1024;

/// Relay copy buffer size (32 KB)
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;
