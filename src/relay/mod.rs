//! Bidirectional relay between two endpoints
//!
//! Two copy loops run concurrently, `a -> b` and `b -> a`, each with its own
//! fixed buffer. The first loop to hit end-of-stream or an error lingers, then
//! closes both endpoints through a shared close-once guard; the other loop is
//! cancelled at that point and exits without lingering or closing again.

use crate::protocol::RELAY_BUFFER_SIZE;
use crate::transport::Endpoint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Bytes copied in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Closes both endpoints once, whichever direction gets there first
struct CloseGuard {
    closed: AtomicBool,
    cancel: watch::Sender<bool>,
}

impl CloseGuard {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    async fn cancelled(&self) {
        let mut cancel = self.cancel.subscribe();
        let _ = cancel.wait_for(|cancelled| *cancelled).await;
    }

    async fn close_both<A, B>(&self, a: &A, b: &B)
    where
        A: Endpoint + ?Sized,
        B: Endpoint + ?Sized,
    {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Release the other loop before touching the endpoints it may hold
        self.cancel.send_replace(true);

        if let Err(e) = a.close().await {
            trace!("Relay endpoint close failed: {}", e);
        }
        if let Err(e) = b.close().await {
            trace!("Relay endpoint close failed: {}", e);
        }
    }
}

/// How one copy loop stopped
enum Finish {
    /// Source ended or an I/O error occurred
    Ended,
    /// The other direction already tore the relay down
    Cancelled,
}

async fn copy_half<S, D>(
    src: &S,
    dst: &D,
    guard: &CloseGuard,
    linger: Duration,
    direction: &str,
) -> u64
where
    S: Endpoint + ?Sized,
    D: Endpoint + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    let finish = loop {
        let n = tokio::select! {
            biased;
            _ = guard.cancelled() => break Finish::Cancelled,
            read = src.read(&mut buf) => match read {
                Ok(0) => {
                    trace!("{}: EOF reached", direction);
                    break Finish::Ended;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("{}: Read error: {}", direction, e);
                    break Finish::Ended;
                }
            },
        };

        let written = tokio::select! {
            biased;
            _ = guard.cancelled() => break Finish::Cancelled,
            written = dst.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            debug!("{}: Write error: {}", direction, e);
            break Finish::Ended;
        }
        total += n as u64;
    };

    if let Finish::Ended = finish {
        if !linger.is_zero() {
            tokio::time::sleep(linger).await;
        }
        guard.close_both(src, dst).await;
    }

    trace!("{}: Transferred {} bytes", direction, total);
    total
}

/// Copy bytes both ways between `a` and `b` until either side ends, then
/// close both exactly once. Returns after both copy loops have finished.
pub async fn relay<A, B>(a: A, b: B, linger: Duration) -> RelayStats
where
    A: Endpoint,
    B: Endpoint,
{
    let guard = CloseGuard::new();

    let (a_to_b, b_to_a) = tokio::join!(
        copy_half(&a, &b, &guard, linger, "a->b"),
        copy_half(&b, &a, &guard, linger, "b->a"),
    );

    debug!(a_to_b, b_to_a, "Relay finished");
    RelayStats { a_to_b, b_to_a }
}

/// Run [`relay`] on its own task
pub fn spawn_relay<A, B>(a: A, b: B, linger: Duration) -> JoinHandle<RelayStats>
where
    A: Endpoint + 'static,
    B: Endpoint + 'static,
{
    tokio::spawn(relay(a, b, linger))
}
