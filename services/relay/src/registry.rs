//! Process-wide session registry and shutdown coordination.
//!
//! Sessions register on open and deregister on close; nothing else touches
//! the set. The shutdown coordinator flips a watch flag every session
//! subscribes to, then the binary waits (bounded) for the set to drain.

use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

/// How long shutdown waits for live sessions to drain before the process
/// force-exits.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct SessionRegistry {
    sessions: Mutex<HashSet<Uuid>>,
    shutdown: watch::Sender<bool>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            sessions: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    pub async fn register(&self, id: Uuid) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(id);
        tracing::debug!(session_id = %id, live = sessions.len(), "Session registered");
    }

    pub async fn deregister(&self, id: Uuid) {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id);
        tracing::debug!(session_id = %id, live = sessions.len(), "Session deregistered");
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// A receiver that resolves once shutdown has been requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signals every live session to close and stops new sessions from
    /// being admitted. Safe to call more than once.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Waits for the registry to drain, up to `grace`. Returns whether it
    /// drained in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.live_count().await == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
