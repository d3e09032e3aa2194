//! Plain socket endpoints and TCP dialing

use super::{Backoff, Endpoint, TransportError};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// [`Endpoint`] over any tokio byte stream
pub struct IoEndpoint<T> {
    reader: Mutex<ReadHalf<T>>,
    writer: Mutex<Option<WriteHalf<T>>>,
}

/// Endpoint over a TCP connection
pub type TcpEndpoint = IoEndpoint<TcpStream>;

impl<T> IoEndpoint<T>
where
    T: AsyncRead + AsyncWrite,
{
    pub fn new(io: T) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
        }
    }
}

impl TcpEndpoint {
    /// Wrap an accepted or dialled TCP connection
    pub fn from_tcp(stream: TcpStream) -> Self {
        // Frames and relayed chunks are already coalesced
        stream.set_nodelay(true).ok();
        Self::new(stream)
    }
}

#[async_trait]
impl<T> Endpoint for IoEndpoint<T>
where
    T: AsyncRead + AsyncWrite + Send,
{
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "endpoint closed"))?;
        writer.write_all(data).await
    }

    async fn close(&self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for IoEndpoint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoEndpoint").finish_non_exhaustive()
    }
}

/// Connect to `addr` once, bounded by `timeout`
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    stream.set_nodelay(true).ok();
    debug!(addr, "Connected");
    Ok(stream)
}

/// Connect to `addr`, retrying under `backoff`
pub async fn dial(
    addr: &str,
    timeout: Duration,
    backoff: &Backoff,
) -> Result<TcpStream, TransportError> {
    backoff.retry(|| connect(addr, timeout)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_tcp_endpoint_echo() {
        // Start a simple echo server
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let stream = connect(&addr.to_string(), TIMEOUT).await.unwrap();
        let endpoint = TcpEndpoint::from_tcp(stream);

        let msg = b"Hello, TCP!";
        endpoint.write_all(msg).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = endpoint.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], msg);

        endpoint.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sends_eof() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let endpoint = IoEndpoint::new(local);

        endpoint.write_all(b"bye").await.unwrap();
        endpoint.close().await.unwrap();
        endpoint.close().await.unwrap();

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        let err = endpoint.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_dial_gives_up_on_refused_port() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = dial(&addr, TIMEOUT, &Backoff::immediate(2)).await;
        assert!(matches!(
            result,
            Err(TransportError::RetriesExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_dial_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let stream = dial(&addr, TIMEOUT, &Backoff::default()).await.unwrap();
        assert!(stream.nodelay().unwrap());
        accept.await.unwrap().unwrap();
    }
}
