//! Transport layer
//!
//! Provides:
//! - The [`Endpoint`] capability shared by tunnel streams and plain sockets
//! - TCP dialing with connect timeouts
//! - A reusable retry/backoff policy for dial call sites

mod backoff;
mod tcp;

pub use backoff::Backoff;
pub use tcp::{connect, dial, IoEndpoint, TcpEndpoint};

use async_trait::async_trait;
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout")]
    Timeout,

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// A byte-stream endpoint that can be read, written and closed through a
/// shared reference
///
/// Implemented by tunnel streams and by [`IoEndpoint`], so a relay can pump
/// bytes between either kind without knowing which it holds.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Read into `buf`; `Ok(0)` is end-of-stream
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data`
    async fn write_all(&self, data: &[u8]) -> io::Result<()>;

    /// Close the write side. Idempotent.
    async fn close(&self) -> io::Result<()>;
}
