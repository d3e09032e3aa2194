//! Session multiplexer
//!
//! A [`Session`] owns one physical connection and carries many [`Stream`]s
//! over it. Three tasks run per session:
//! - the writer task owns the write half and serializes every frame,
//! - the receive task owns the read half and demultiplexes inbound frames,
//! - the optional keepalive task sends NOPs and enforces the idle timeout.
//!
//! Stream ids are split by parity: the initiator allocates odd ids, the
//! responder even ids. Ids are never reused within a session.

use super::frame::{Command, Frame, FrameCodec, FRAME_HEADER_SIZE, NONCE_SIZE};
use super::stream::{Stream, StreamShared};
use super::TunnelError;
use crate::crypto::{Direction, Keyring, PayloadCipher, TAG_LEN};
use crate::protocol::{
    ProtocolError, DEFAULT_ACCEPT_BACKLOG, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT,
    MAX_PAYLOAD_SIZE,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Depth of the outbound frame queue
const WRITE_QUEUE_DEPTH: usize = 256;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which end of the physical connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialled the physical connection; allocates odd stream ids
    Initiator,
    /// Accepted the physical connection; allocates even stream ids
    Responder,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Initiator => 1,
            Role::Responder => 2,
        }
    }

    /// Whether `stream_id` belongs to this side's allocation range
    fn owns(self, stream_id: u32) -> bool {
        match self {
            Role::Initiator => stream_id % 2 == 1,
            Role::Responder => stream_id % 2 == 0,
        }
    }

    fn outbound(self) -> Direction {
        match self {
            Role::Initiator => Direction::InitiatorToResponder,
            Role::Responder => Direction::ResponderToInitiator,
        }
    }

    fn inbound(self) -> Direction {
        match self {
            Role::Initiator => Direction::ResponderToInitiator,
            Role::Responder => Direction::InitiatorToResponder,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Send a NOP this often (None disables keepalive entirely)
    pub keepalive_interval: Option<Duration>,
    /// Close the session if nothing arrives for this long
    pub keepalive_timeout: Duration,
    /// Maximum plaintext bytes per PSH frame
    pub max_payload: usize,
    /// Inbound streams queued ahead of `accept_stream`
    pub accept_backlog: usize,
    /// Seal PSH payloads with ChaCha20-Poly1305
    pub encrypt_payload: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(Duration::from_secs(KEEPALIVE_INTERVAL)),
            keepalive_timeout: Duration::from_secs(KEEPALIVE_TIMEOUT),
            max_payload: MAX_PAYLOAD_SIZE,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            encrypt_payload: true,
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), TunnelError> {
        if self.max_payload == 0 || self.max_payload > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::InvalidConfig(format!(
                "max_payload must be within 1..={}",
                MAX_PAYLOAD_SIZE
            )));
        }
        if self.accept_backlog == 0 {
            return Err(TunnelError::InvalidConfig(
                "accept_backlog must be positive".to_string(),
            ));
        }
        if let Some(interval) = self.keepalive_interval {
            if interval.is_zero() {
                return Err(TunnelError::InvalidConfig(
                    "keepalive_interval must be positive".to_string(),
                ));
            }
            if self.keepalive_timeout < interval {
                return Err(TunnelError::InvalidConfig(
                    "keepalive_timeout must not be shorter than keepalive_interval".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Largest payload length a well-formed peer can declare
    fn max_wire_payload(&self) -> usize {
        if self.encrypt_payload {
            self.max_payload + TAG_LEN
        } else {
            self.max_payload
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// A frame queued for the writer task, with its completion
struct WriteRequest {
    frame: Frame,
    done: oneshot::Sender<Result<(), TunnelError>>,
}

struct SessionInner {
    role: Role,
    config: SessionConfig,
    state: Mutex<SessionState>,
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    next_stream_id: AtomicU32,
    write_tx: mpsc::Sender<WriteRequest>,
    accept_tx: mpsc::Sender<Arc<StreamShared>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<StreamShared>>>,
    shutdown: watch::Sender<bool>,
    /// Set by the receive loop on every frame, cleared by the keepalive check
    data_ready: AtomicBool,
}

/// Multiplexed session over one physical connection
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start a session on `conn`. Must be called from within a tokio runtime.
    ///
    /// No handshake frame is exchanged; fails only on invalid configuration.
    pub fn open<T>(
        conn: T,
        keyring: Keyring,
        role: Role,
        config: SessionConfig,
    ) -> Result<Self, TunnelError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;

        let (sealer, opener) = if config.encrypt_payload {
            (
                Some(PayloadCipher::new(&keyring, role.outbound())),
                Some(PayloadCipher::new(&keyring, role.inbound())),
            )
        } else {
            (None, None)
        };

        let (reader, writer) = tokio::io::split(conn);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        let (shutdown, _) = watch::channel(false);
        let keepalive = config
            .keepalive_interval
            .map(|interval| (interval, config.keepalive_timeout));

        let session = Self {
            inner: Arc::new(SessionInner {
                role,
                config,
                state: Mutex::new(SessionState::Open),
                streams: Mutex::new(HashMap::new()),
                next_stream_id: AtomicU32::new(role.first_stream_id()),
                write_tx,
                accept_tx,
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                shutdown,
                data_ready: AtomicBool::new(false),
            }),
        };

        let codec = FrameCodec::new(keyring);
        tokio::spawn(session.clone().write_loop(writer, write_rx, codec.clone(), sealer));
        tokio::spawn(session.clone().recv_loop(reader, codec, opener));
        if let Some((interval, timeout)) = keepalive {
            tokio::spawn(session.clone().keepalive_loop(interval, timeout));
        }

        debug!(?role, "Session opened");
        Ok(session)
    }

    /// Local role
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    /// Non-blocking liveness check
    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Open
    }

    /// Number of streams currently registered
    pub fn stream_count(&self) -> usize {
        lock(&self.inner.streams).len()
    }

    /// Open a new stream. Sends SYN and returns without waiting for the peer.
    pub async fn open_stream(&self) -> Result<Stream, TunnelError> {
        let stream_id = self
            .inner
            .next_stream_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(2))
            .map_err(|_| TunnelError::StreamIdsExhausted)?;

        let shared = Arc::new(StreamShared::new(stream_id, false));
        {
            let mut streams = lock(&self.inner.streams);
            if self.is_closed() {
                return Err(TunnelError::SessionClosed);
            }
            streams.insert(stream_id, Arc::clone(&shared));
        }

        if let Err(e) = self.write_frame(Frame::syn(stream_id)).await {
            self.remove_stream(stream_id);
            return Err(e);
        }
        shared.mark_established();

        debug!(stream_id, "Opened stream");
        Ok(Stream::new(shared, self.clone()))
    }

    /// Wait for the peer to open a stream
    pub async fn accept_stream(&self) -> Result<Stream, TunnelError> {
        let accepted = async {
            let mut accept_rx = self.inner.accept_rx.lock().await;
            accept_rx.recv().await
        };

        tokio::select! {
            biased;
            _ = self.closed() => Err(TunnelError::SessionClosed),
            shared = accepted => match shared {
                Some(shared) => Ok(Stream::new(shared, self.clone())),
                None => Err(TunnelError::SessionClosed),
            },
        }
    }

    /// Close the session, the physical connection and every stream on it.
    /// Idempotent.
    pub fn close(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state != SessionState::Open {
                return;
            }
            *state = SessionState::Closing;
        }

        // Stops the writer, receive and keepalive tasks; dropping their
        // halves closes the physical connection.
        self.inner.shutdown.send_replace(true);

        let streams: Vec<_> = {
            let mut streams = lock(&self.inner.streams);
            streams.drain().map(|(_, stream)| stream).collect()
        };
        let count = streams.len();
        for stream in streams {
            stream.close_session();
        }

        *lock(&self.inner.state) = SessionState::Closed;
        debug!(role = ?self.role(), streams = count, "Session closed");
    }

    /// Resolves once the session has closed
    pub async fn closed(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let _ = shutdown.wait_for(|closed| *closed).await;
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.inner.config.max_payload
    }

    pub(crate) fn remove_stream(&self, stream_id: u32) {
        if lock(&self.inner.streams).remove(&stream_id).is_some() {
            trace!(stream_id, "Evicted stream");
        }
    }

    /// Queue one frame and wait until the writer task has put it on the wire
    pub(crate) async fn write_frame(&self, frame: Frame) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let (done, result) = oneshot::channel();
        tokio::select! {
            biased;
            _ = self.closed() => return Err(TunnelError::SessionClosed),
            sent = self.inner.write_tx.send(WriteRequest { frame, done }) => {
                sent.map_err(|_| TunnelError::SessionClosed)?;
            }
        }

        tokio::select! {
            biased;
            written = result => written.unwrap_or(Err(TunnelError::SessionClosed)),
            _ = self.closed() => Err(TunnelError::SessionClosed),
        }
    }

    async fn write_loop<W>(
        self,
        mut writer: W,
        mut write_rx: mpsc::Receiver<WriteRequest>,
        codec: FrameCodec,
        mut sealer: Option<PayloadCipher>,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.closed() => break,
                request = write_rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let written = tokio::select! {
                biased;
                _ = self.closed() => Err(TunnelError::SessionClosed),
                written = write_one(&mut writer, &codec, sealer.as_mut(), &request.frame) => written,
            };

            match written {
                Ok(()) => {
                    let _ = request.done.send(Ok(()));
                }
                Err(e) => {
                    debug!("Session write failed: {}", e);
                    let _ = request.done.send(Err(e));
                    break;
                }
            }
        }

        self.close();
    }

    async fn recv_loop<R>(self, mut reader: R, codec: FrameCodec, mut opener: Option<PayloadCipher>)
    where
        R: AsyncRead + Unpin,
    {
        let result = tokio::select! {
            biased;
            _ = self.closed() => Ok(()),
            result = self.read_frames(&mut reader, &codec, opener.as_mut()) => result,
        };

        match result {
            Ok(()) => {}
            Err(TunnelError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Peer disconnected");
            }
            Err(TunnelError::Protocol(e)) => {
                warn!(role = ?self.inner.role, "Closing session on protocol error: {}", e);
            }
            Err(e) => {
                debug!("Session read failed: {}", e);
            }
        }

        self.close();
    }

    async fn read_frames<R>(
        &self,
        reader: &mut R,
        codec: &FrameCodec,
        mut opener: Option<&mut PayloadCipher>,
    ) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
    {
        let max_wire_payload = self.inner.config.max_wire_payload();
        let mut header = [0u8; FRAME_HEADER_SIZE];

        loop {
            reader.read_exact(&mut header).await?;
            let frame = codec.decode_header(&header)?;
            self.inner.data_ready.store(true, Ordering::Relaxed);

            let length = frame.length as usize;
            if length > max_wire_payload {
                return Err(ProtocolError::PayloadTooLarge(length).into());
            }
            let mut payload = vec![0u8; length];
            reader.read_exact(&mut payload).await?;

            trace!(
                command = ?frame.command,
                stream_id = frame.stream_id,
                length,
                "Received frame"
            );

            match frame.command {
                Command::Nop => {}
                Command::Syn => self.handle_syn(frame.stream_id).await?,
                Command::Psh => {
                    let data = match opener.as_deref_mut() {
                        Some(cipher) => cipher
                            .open(&header[..NONCE_SIZE], &header, &payload)
                            .map_err(|_| ProtocolError::DecryptFailed)?,
                        None => payload,
                    };
                    self.handle_psh(frame.stream_id, Bytes::from(data));
                }
                Command::Fin => self.handle_fin(frame.stream_id),
            }
        }
    }

    async fn handle_syn(&self, stream_id: u32) -> Result<(), TunnelError> {
        if stream_id == 0 || self.inner.role.owns(stream_id) {
            warn!(stream_id, "Ignoring SYN for an id outside the peer's range");
            return Ok(());
        }

        let shared = {
            let mut streams = lock(&self.inner.streams);
            if streams.contains_key(&stream_id) {
                warn!(stream_id, "Ignoring duplicate SYN");
                return Ok(());
            }
            let shared = Arc::new(StreamShared::new(stream_id, true));
            streams.insert(stream_id, Arc::clone(&shared));
            shared
        };

        debug!(stream_id = shared.id(), "Accepted stream");
        self.inner
            .accept_tx
            .send(shared)
            .await
            .map_err(|_| TunnelError::SessionClosed)
    }

    fn handle_psh(&self, stream_id: u32, data: Bytes) {
        let stream = lock(&self.inner.streams).get(&stream_id).cloned();
        match stream {
            Some(stream) => {
                if !stream.push_data(data) {
                    trace!(stream_id, "Dropping data after FIN");
                }
            }
            None => trace!(stream_id, "Dropping data for unknown stream"),
        }
    }

    fn handle_fin(&self, stream_id: u32) {
        let stream = lock(&self.inner.streams).get(&stream_id).cloned();
        if let Some(stream) = stream {
            debug!(stream_id, "Remote closed stream");
            if stream.close_remote() {
                self.remove_stream(stream_id);
            }
        }
    }

    async fn keepalive_loop(self, interval: Duration, timeout: Duration) {
        let mut ping = tokio::time::interval(interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut check = tokio::time::interval_at(tokio::time::Instant::now() + timeout, timeout);
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.closed() => break,
                _ = check.tick() => {
                    if !self.inner.data_ready.swap(false, Ordering::Relaxed) {
                        warn!(role = ?self.inner.role, "Keepalive timeout, closing session");
                        self.close();
                        break;
                    }
                }
                _ = ping.tick() => {
                    if self.write_frame(Frame::nop()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("streams", &self.stream_count())
            .finish()
    }
}

/// Mask the header, seal a PSH payload against it, and write both as one buffer
async fn write_one<W>(
    writer: &mut W,
    codec: &FrameCodec,
    sealer: Option<&mut PayloadCipher>,
    frame: &Frame,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let (header, payload) = match (frame.command, sealer) {
        (Command::Psh, Some(cipher)) => {
            let sealed_len = frame.payload.len() + TAG_LEN;
            let header = codec.encode_header(frame.command, frame.stream_id, sealed_len)?;
            let sealed = cipher.seal(&header[..NONCE_SIZE], &header, &frame.payload)?;
            (header, Bytes::from(sealed))
        }
        _ => {
            let header =
                codec.encode_header(frame.command, frame.stream_id, frame.payload.len())?;
            (header, frame.payload.clone())
        }
    };

    let mut wire_buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    wire_buf.put_slice(&header);
    wire_buf.put_slice(&payload);
    writer.write_all(&wire_buf).await?;
    writer.flush().await?;

    trace!(
        command = ?frame.command,
        stream_id = frame.stream_id,
        length = payload.len(),
        "Sent frame"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn pair_with(config: SessionConfig) -> (Session, Session) {
        let (a, b) = duplex(256 * 1024);
        let keyring = Keyring::new("session-test");
        let client = Session::open(a, keyring.clone(), Role::Initiator, config.clone()).unwrap();
        let server = Session::open(b, keyring, Role::Responder, config).unwrap();
        (client, server)
    }

    fn pair() -> (Session, Session) {
        pair_with(SessionConfig::default())
    }

    #[test]
    fn test_role_stream_ids() {
        assert_eq!(Role::Initiator.first_stream_id(), 1);
        assert_eq!(Role::Responder.first_stream_id(), 2);
        assert!(Role::Initiator.owns(7));
        assert!(Role::Responder.owns(8));
        assert!(!Role::Responder.owns(7));
    }

    #[test]
    fn test_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());

        let too_big = SessionConfig {
            max_payload: MAX_PAYLOAD_SIZE + 1,
            ..Default::default()
        };
        assert!(matches!(too_big.validate(), Err(TunnelError::InvalidConfig(_))));

        let short_timeout = SessionConfig {
            keepalive_interval: Some(Duration::from_secs(10)),
            keepalive_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(short_timeout.validate().is_err());
    }

    #[tokio::test]
    async fn test_open_invalid_config_fails() {
        let (a, _b) = duplex(1024);
        let config = SessionConfig {
            accept_backlog: 0,
            ..Default::default()
        };
        let result = Session::open(a, Keyring::new("k"), Role::Initiator, config);
        assert!(matches!(result, Err(TunnelError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_open_and_accept() {
        let (client, server) = pair();

        let s1 = client.open_stream().await.unwrap();
        let s2 = client.open_stream().await.unwrap();
        assert_eq!(s1.id(), 1);
        assert_eq!(s2.id(), 3);

        let r1 = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        let r2 = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        assert_eq!(r1.id(), 1);
        assert_eq!(r2.id(), 3);

        let back = server.open_stream().await.unwrap();
        assert_eq!(back.id(), 2);
        let accepted = timeout(WAIT, client.accept_stream()).await.unwrap().unwrap();
        assert_eq!(accepted.id(), 2);
    }

    #[tokio::test]
    async fn test_stream_ordering() {
        let (client, server) = pair();

        let stream = client.open_stream().await.unwrap();
        for chunk in [&b"A"[..], b"B", b"C"] {
            stream.write(chunk).await.unwrap();
        }
        stream.close().await.unwrap();

        let peer = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = timeout(WAIT, peer.read(&mut buf)).await.unwrap().unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"ABC");
    }

    #[tokio::test]
    async fn test_large_write_is_fragmented() {
        let config = SessionConfig {
            max_payload: 1000,
            ..Default::default()
        };
        let (client, server) = pair_with(config);

        let data: Vec<u8> = (0..10_500).map(|i| (i % 256) as u8).collect();
        let stream = client.open_stream().await.unwrap();
        assert_eq!(stream.write(&data).await.unwrap(), data.len());
        stream.close().await.unwrap();

        let peer = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = timeout(WAIT, peer.read(&mut buf)).await.unwrap().unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_unencrypted_payloads() {
        let config = SessionConfig {
            encrypt_payload: false,
            ..Default::default()
        };
        let (client, server) = pair_with(config);

        let stream = client.open_stream().await.unwrap();
        stream.write(b"plain").await.unwrap();

        let peer = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        let mut buf = [0u8; 16];
        let n = timeout(WAIT, peer.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"plain");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (client, _server) = pair();

        let stream = client.open_stream().await.unwrap();
        stream.close().await.unwrap();
        stream.close().await.unwrap();

        assert!(matches!(
            stream.write(b"late").await,
            Err(TunnelError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_fully_closed_stream_is_evicted() {
        let (client, server) = pair();

        let stream = client.open_stream().await.unwrap();
        let peer = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        assert_eq!(client.stream_count(), 1);

        peer.close().await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap(), 0);

        stream.close().await.unwrap();
        assert_eq!(client.stream_count(), 0);

        // The next id is fresh, never the evicted one
        let next = client.open_stream().await.unwrap();
        assert_eq!(next.id(), 3);
    }

    #[tokio::test]
    async fn test_close_cascades_to_streams() {
        let (client, server) = pair();

        let s1 = client.open_stream().await.unwrap();
        let s2 = client.open_stream().await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            s1.read(&mut buf).await
        });
        tokio::task::yield_now().await;

        client.close();
        client.close();
        assert!(client.is_closed());
        assert_eq!(client.state(), SessionState::Closed);

        let read = timeout(WAIT, reader).await.unwrap().unwrap();
        assert!(matches!(read, Err(TunnelError::SessionClosed)));
        assert!(matches!(s2.write(b"x").await, Err(TunnelError::SessionClosed)));
        assert!(matches!(client.open_stream().await, Err(TunnelError::SessionClosed)));
        assert!(matches!(client.accept_stream().await, Err(TunnelError::SessionClosed)));

        // The peer sees the physical connection go away
        timeout(WAIT, server.closed()).await.unwrap();
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_garbage_closes_session() {
        let (mut raw, conn) = duplex(4096);
        let server = Session::open(
            conn,
            Keyring::new("k"),
            Role::Responder,
            SessionConfig::default(),
        )
        .unwrap();

        raw.write_all(&[0xAB; FRAME_HEADER_SIZE]).await.unwrap();

        timeout(WAIT, server.closed()).await.unwrap();
        assert!(matches!(server.accept_stream().await, Err(TunnelError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_mismatched_keys_close_session() {
        let (a, b) = duplex(4096);
        let client = Session::open(a, Keyring::new("one"), Role::Initiator, SessionConfig::default())
            .unwrap();
        let server = Session::open(b, Keyring::new("two"), Role::Responder, SessionConfig::default())
            .unwrap();

        let _stream = client.open_stream().await.unwrap();

        timeout(WAIT, server.closed()).await.unwrap();
        timeout(WAIT, client.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_psh_for_unknown_stream_is_dropped() {
        let (mut raw, conn) = duplex(4096);
        let keyring = Keyring::new("k");
        let config = SessionConfig {
            encrypt_payload: false,
            ..Default::default()
        };
        let server = Session::open(conn, keyring.clone(), Role::Responder, config).unwrap();

        let codec = FrameCodec::new(keyring);
        let stray = codec.encode(&Frame::psh(99, Bytes::from_static(b"lost"))).unwrap();
        let open = codec.encode(&Frame::syn(1)).unwrap();
        let data = codec.encode(&Frame::psh(1, Bytes::from_static(b"kept"))).unwrap();
        raw.write_all(&stray).await.unwrap();
        raw.write_all(&open).await.unwrap();
        raw.write_all(&data).await.unwrap();

        let stream = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        let mut buf = [0u8; 8];
        let n = timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"kept");
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_syn_in_own_range_ignored() {
        let (mut raw, conn) = duplex(4096);
        let keyring = Keyring::new("k");
        let server = Session::open(
            conn,
            keyring.clone(),
            Role::Responder,
            SessionConfig::default(),
        )
        .unwrap();

        let codec = FrameCodec::new(keyring);
        raw.write_all(&codec.encode(&Frame::syn(2)).unwrap()).await.unwrap();
        raw.write_all(&codec.encode(&Frame::syn(1)).unwrap()).await.unwrap();
        raw.write_all(&codec.encode(&Frame::syn(1)).unwrap()).await.unwrap();

        let stream = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        assert_eq!(stream.id(), 1);
        assert!(timeout(Duration::from_millis(100), server.accept_stream())
            .await
            .is_err());
        assert_eq!(server.stream_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timeout_closes_silent_session() {
        // Peer end is held open but never sends anything
        let (conn, _silent): (DuplexStream, DuplexStream) = duplex(4096);
        let config = SessionConfig {
            keepalive_interval: Some(Duration::from_secs(1)),
            keepalive_timeout: Duration::from_secs(3),
            ..Default::default()
        };
        let session = Session::open(conn, Keyring::new("k"), Role::Initiator, config).unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        timeout(WAIT, session.closed()).await.unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_holds_idle_session_open() {
        let config = SessionConfig {
            keepalive_interval: Some(Duration::from_secs(1)),
            keepalive_timeout: Duration::from_secs(3),
            ..Default::default()
        };
        let (client, server) = pair_with(config);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }

    /// Read raw frames until the first PSH, returning its wire payload
    async fn next_psh_payload(raw: &mut DuplexStream, codec: &FrameCodec) -> Vec<u8> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        loop {
            raw.read_exact(&mut header).await.unwrap();
            let frame = codec.decode_header(&header).unwrap();
            let mut payload = vec![0u8; frame.length as usize];
            raw.read_exact(&mut payload).await.unwrap();
            if frame.command == Command::Psh {
                return payload;
            }
        }
    }

    #[tokio::test]
    async fn test_sessions_sharing_a_secret_seal_independently() {
        let keyring = Keyring::new("shared");
        let codec = FrameCodec::new(keyring.clone());
        let plaintexts = [[0x11u8; 16], [0x22u8; 16]];

        // Same secret, same role, same stream id, same position in the session
        let mut sealed = Vec::new();
        for plaintext in plaintexts {
            let (conn, mut raw) = duplex(4096);
            let session =
                Session::open(conn, keyring.clone(), Role::Initiator, SessionConfig::default())
                    .unwrap();
            let stream = session.open_stream().await.unwrap();
            assert_eq!(stream.id(), 1);
            stream.write(&plaintext).await.unwrap();

            sealed.push(timeout(WAIT, next_psh_payload(&mut raw, &codec)).await.unwrap());
            session.close();
        }

        assert_eq!(sealed[0].len(), 16 + TAG_LEN);
        assert_ne!(sealed[0], sealed[1]);

        let cipher_xor: Vec<u8> = sealed[0]
            .iter()
            .zip(&sealed[1])
            .take(16)
            .map(|(a, b)| a ^ b)
            .collect();
        assert_ne!(cipher_xor, vec![0x11u8 ^ 0x22; 16]);
    }

    #[tokio::test]
    async fn test_close_unblocks_write_stalled_on_backpressure() {
        // Peer end is held open but never read
        let (conn, _stalled) = duplex(1024);
        let session =
            Session::open(conn, Keyring::new("k"), Role::Initiator, SessionConfig::default())
                .unwrap();
        let stream = session.open_stream().await.unwrap();

        let writer = tokio::spawn(async move { stream.write(&vec![0u8; 4 * 1024 * 1024]).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writer.is_finished());

        session.close();
        let result = timeout(WAIT, writer).await.unwrap().unwrap();
        assert!(matches!(result, Err(TunnelError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_stream_ids_exhaust_at_top_of_u32() {
        let (client, _server) = pair();
        client
            .inner
            .next_stream_id
            .store(u32::MAX - 2, Ordering::SeqCst);

        let last = client.open_stream().await.unwrap();
        assert_eq!(last.id(), u32::MAX - 2);
        assert!(matches!(
            client.open_stream().await,
            Err(TunnelError::StreamIdsExhausted)
        ));
        // Ids never wrap back into the live range
        assert!(matches!(
            client.open_stream().await,
            Err(TunnelError::StreamIdsExhausted)
        ));
        assert!(!client.is_closed());
    }
}
