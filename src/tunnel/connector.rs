//! Client side of the tunnel
//!
//! A [`Connector`] keeps one initiator session to the tunnel server and
//! re-dials it when it drops. [`serve_ingress`] accepts local connections and
//! carries each one over its own stream. Opening a stream, including any
//! re-dial, runs in the connection's own task.

use super::{Role, Session, SessionConfig, SessionRegistry, Stream, TunnelError};
use crate::crypto::Keyring;
use crate::relay::relay;
use crate::transport::{dial, Backoff, TcpEndpoint};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Initiator session to the tunnel server, re-established on demand
pub struct Connector {
    server_addr: String,
    keyring: Keyring,
    config: SessionConfig,
    backoff: Backoff,
    connect_timeout: Duration,
    registry: SessionRegistry,
    current: Mutex<Option<Session>>,
}

impl Connector {
    pub fn new(
        server_addr: impl Into<String>,
        keyring: Keyring,
        config: SessionConfig,
        backoff: Backoff,
        connect_timeout: Duration,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            keyring,
            config,
            backoff,
            connect_timeout,
            registry,
            current: Mutex::new(None),
        }
    }

    /// Tunnel server address
    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Live session, dialing a new one if the last has closed.
    ///
    /// Concurrent callers queue behind a single dial.
    pub async fn session(&self) -> crate::Result<Session> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            info!("Tunnel session lost, reconnecting...");
        }
        *current = None;

        let conn = dial(&self.server_addr, self.connect_timeout, &self.backoff).await?;
        let session = Session::open(conn, self.keyring.clone(), Role::Initiator, self.config.clone())?;

        self.registry.register(&session);
        info!("Connected to {}", self.server_addr);
        *current = Some(session.clone());
        Ok(session)
    }

    /// Open a stream, re-dialing once if the session died underneath us
    pub async fn open_stream(&self) -> crate::Result<Stream> {
        let session = self.session().await?;
        match session.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(TunnelError::SessionClosed) => {
                let session = self.session().await?;
                Ok(session.open_stream().await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Accept local connections until `shutdown` resolves, relaying each over a
/// fresh stream
pub async fn serve_ingress<F>(
    listener: TcpListener,
    connector: Arc<Connector>,
    linger: Duration,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((conn, peer_addr)) => {
                        debug!("New local connection from {}", peer_addr);
                        let connector = Arc::clone(&connector);
                        tokio::spawn(carry_connection(conn, peer_addr, connector, linger));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown => break,
        }
    }
}

async fn carry_connection(
    conn: TcpStream,
    peer_addr: SocketAddr,
    connector: Arc<Connector>,
    linger: Duration,
) {
    let stream = match connector.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Tunnel unavailable, dropping {}: {}", peer_addr, e);
            return;
        }
    };

    let stream_id = stream.id();
    debug!(stream_id, "Relaying {}", peer_addr);
    let stats = relay(TcpEndpoint::from_tcp(conn), stream, linger).await;
    debug!(
        stream_id,
        "Stream finished: {} bytes up, {} bytes down", stats.a_to_b, stats.b_to_a
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Loopback address nothing listens on
    async fn unused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_open() {
        let connector = Connector::new(
            unused_addr().await,
            Keyring::new("k"),
            SessionConfig::default(),
            Backoff::immediate(2),
            Duration::from_millis(200),
            SessionRegistry::new(),
        );
        let result = timeout(WAIT, connector.open_stream()).await.unwrap();
        assert!(matches!(result, Err(crate::Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_session_is_reused_then_redialed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((conn, _)) = listener.accept().await {
                let session =
                    Session::open(conn, Keyring::new("k"), Role::Responder, SessionConfig::default())
                        .unwrap();
                tokio::spawn(async move { while session.accept_stream().await.is_ok() {} });
            }
        });

        let registry = SessionRegistry::new();
        let connector = Connector::new(
            addr,
            Keyring::new("k"),
            SessionConfig::default(),
            Backoff::immediate(3),
            WAIT,
            registry.clone(),
        );

        let first = connector.session().await.unwrap();
        let same = connector.session().await.unwrap();
        assert_eq!(first.open_stream().await.unwrap().id(), 1);
        assert_eq!(same.open_stream().await.unwrap().id(), 3);

        first.close();
        let stream = connector.open_stream().await.unwrap();
        assert_eq!(stream.id(), 1);
        assert!(!connector.session().await.unwrap().is_closed());
    }
}
