//! Tunnel layer - masked, multiplexed communication channel
//!
//! Provides:
//! - Frame header masking and validation
//! - Session/stream multiplexing over one physical connection
//! - Session lifecycle tracking
//! - The reconnecting client side and its ingress loop

mod connector;
mod frame;
mod registry;
mod session;
mod stream;

pub use connector::{serve_ingress, Connector};
pub use frame::{Command, Frame, FrameCodec, FrameHeader, FRAME_HEADER_SIZE, NONCE_SIZE};
pub use registry::SessionRegistry;
pub use session::{Role, Session, SessionConfig, SessionState};
pub use stream::{Stream, StreamState};

use std::io;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Session closed")]
    SessionClosed,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream ids exhausted")]
    StreamIdsExhausted,

    #[error("Invalid session config: {0}")]
    InvalidConfig(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Io(e) => e,
            TunnelError::SessionClosed | TunnelError::StreamClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, err)
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
