//! Multiplexed stream implementation

use super::session::{lock, Session};
use super::{Frame, TunnelError};
use crate::transport::Endpoint;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Opened locally, SYN not yet written
    Init,
    /// Stream is open and active
    Established,
    /// Local side has sent FIN
    LocalClosed,
    /// Remote side has sent FIN
    RemoteClosed,
    /// Both halves closed, or the session went away
    Closed,
}

/// State shared between a stream handle and the session's receive loop
pub(crate) struct StreamShared {
    id: u32,
    inner: Mutex<StreamInner>,
    readable: Notify,
}

#[derive(Default)]
struct StreamInner {
    established: bool,
    local_closed: bool,
    remote_closed: bool,
    session_closed: bool,
    recv_buffer: VecDeque<Bytes>,
}

impl StreamInner {
    fn state(&self) -> StreamState {
        if self.session_closed || (self.local_closed && self.remote_closed) {
            StreamState::Closed
        } else if self.local_closed {
            StreamState::LocalClosed
        } else if self.remote_closed {
            StreamState::RemoteClosed
        } else if self.established {
            StreamState::Established
        } else {
            StreamState::Init
        }
    }

    /// Drain buffered data into `buf` in FIFO order
    fn read_buffered(&mut self, buf: &mut [u8]) -> usize {
        let mut total = 0;

        while total < buf.len() {
            let Some(data) = self.recv_buffer.front_mut() else {
                break;
            };
            let to_copy = std::cmp::min(data.len(), buf.len() - total);
            buf[total..total + to_copy].copy_from_slice(&data[..to_copy]);
            total += to_copy;

            if to_copy == data.len() {
                self.recv_buffer.pop_front();
            } else {
                *data = data.slice(to_copy..);
            }
        }

        total
    }
}

impl StreamShared {
    pub(crate) fn new(id: u32, established: bool) -> Self {
        Self {
            id,
            inner: Mutex::new(StreamInner {
                established,
                ..Default::default()
            }),
            readable: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn state(&self) -> StreamState {
        lock(&self.inner).state()
    }

    pub(crate) fn mark_established(&self) {
        lock(&self.inner).established = true;
    }

    /// Queue inbound data. Returns false if the peer already half-closed.
    pub(crate) fn push_data(&self, data: Bytes) -> bool {
        {
            let mut inner = lock(&self.inner);
            if inner.remote_closed || inner.session_closed {
                return false;
            }
            if !data.is_empty() {
                inner.recv_buffer.push_back(data);
            }
        }
        self.readable.notify_waiters();
        true
    }

    /// Peer sent FIN. Returns true once both halves are closed.
    pub(crate) fn close_remote(&self) -> bool {
        let fully_closed = {
            let mut inner = lock(&self.inner);
            inner.remote_closed = true;
            inner.local_closed
        };
        self.readable.notify_waiters();
        fully_closed
    }

    /// Owning session went away; wakes every pending reader
    pub(crate) fn close_session(&self) {
        lock(&self.inner).session_closed = true;
        self.readable.notify_waiters();
    }
}

/// One logical, ordered byte stream inside a [`Session`]
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Session,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, session: Session) -> Self {
        Self { shared, session }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Get current state
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Read buffered data, waiting for more if none is available.
    ///
    /// Returns `Ok(0)` once the peer's FIN has been processed and the buffer
    /// is drained, and [`TunnelError::SessionClosed`] if the session closed
    /// first.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = lock(&self.shared.inner);
                let n = inner.read_buffered(buf);
                if n > 0 {
                    return Ok(n);
                }
                if inner.remote_closed {
                    return Ok(0);
                }
                if inner.session_closed {
                    return Err(TunnelError::SessionClosed);
                }
            }

            notified.await;
        }
    }

    /// Write `data`, fragmented into PSH frames of at most the session's
    /// maximum payload
    pub async fn write(&self, data: &[u8]) -> Result<usize, TunnelError> {
        {
            let inner = lock(&self.shared.inner);
            if inner.session_closed {
                return Err(TunnelError::SessionClosed);
            }
            if inner.local_closed {
                return Err(TunnelError::StreamClosed);
            }
        }

        for chunk in data.chunks(self.session.max_payload()) {
            self.session
                .write_frame(Frame::psh(self.id(), Bytes::copy_from_slice(chunk)))
                .await?;
        }

        Ok(data.len())
    }

    /// Half-close: send FIN once. Idempotent, and a no-op after the session
    /// has closed.
    pub async fn close(&self) -> Result<(), TunnelError> {
        let fully_closed = {
            let mut inner = lock(&self.shared.inner);
            if inner.local_closed || inner.session_closed {
                return Ok(());
            }
            inner.local_closed = true;
            inner.remote_closed
        };

        if fully_closed {
            self.session.remove_stream(self.id());
        }

        match self.session.write_frame(Frame::fin(self.id())).await {
            Ok(()) | Err(TunnelError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl Endpoint for Stream {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(Stream::read(self, buf).await?)
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        Stream::write(self, data).await?;
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        Ok(Stream::close(self).await?)
    }
}
