//! Live session tracking
//!
//! The server keeps one entry per physical connection so it can report how
//! many tunnels are up and tear them all down on shutdown.

use super::session::{lock, Session};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Set of live sessions. Entries remove themselves when their session closes.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `session` until it closes. Must be called from within a tokio
    /// runtime. Returns the registry id assigned to it.
    pub fn register(&self, session: &Session) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.sessions).insert(id, session.clone());
        debug!(session_id = id, role = ?session.role(), "Session registered");

        let inner = Arc::clone(&self.inner);
        let watched = session.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if lock(&inner.sessions).remove(&id).is_some() {
                debug!(session_id = id, "Session deregistered");
            }
        });

        id
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered session
    pub fn close_all(&self) {
        let sessions: Vec<_> = lock(&self.inner.sessions)
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.close();
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}
