//! # veiltun
//!
//! A masked, multiplexed TCP tunnel. An ingress listener accepts plaintext
//! connections and forwards their bytes, through one shared connection to a
//! peer process, to a fixed egress address.
//!
//! ## Features
//!
//! - **Masked frame headers**: every field is XORed with a keystream derived
//!   from a pre-shared secret and a fresh per-frame nonce
//! - **Integrity and replay window** checks on every header
//! - **Sealed payloads** with ChaCha20-Poly1305
//! - **Stream multiplexing**: many logical connections over one socket
//! - **Duplex relay** with deterministic, close-once teardown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Orchestration                       │
//! │      (listeners, dial retry, session registry)       │
//! ├─────────────────────────────────────────────────────┤
//! │                     Relay                            │
//! │        (stream <-> socket, close-once teardown)      │
//! ├─────────────────────────────────────────────────────┤
//! │               Session / Stream                       │
//! │        (SYN/PSH/FIN/NOP, parity stream ids)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  Frame codec                         │
//! │   (masked header, checksum, timestamp, sealing)      │
//! ├─────────────────────────────────────────────────────┤
//! │                   Transport                          │
//! │                 (TCP, backoff)                       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
