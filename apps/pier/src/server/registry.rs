use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tracks live sessions so the listener can stop all of them on close.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

#[derive(Default)]
struct SessionRegistryInner {
    sessions: DashMap<Uuid, SessionEntry>,
    closing: AtomicBool,
    total_sessions: AtomicU64,
}

struct SessionEntry {
    shutdown: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
}

/// Handed to a new session; dropping `guard` removes it from the registry.
pub struct SessionRegistration {
    pub id: Uuid,
    pub shutdown: watch::Receiver<bool>,
    pub guard: SessionGuard,
}

pub struct SessionGuard {
    id: Uuid,
    registry: SessionRegistry,
    finished: watch::Sender<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRemoval {
    pub active_sessions: usize,
    pub total_sessions: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` once the registry is shutting down.
    pub fn register(&self) -> Option<SessionRegistration> {
        if self.inner.closing.load(Ordering::Acquire) {
            return None;
        }

        let id = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);
        self.inner.sessions.insert(
            id,
            SessionEntry {
                shutdown: shutdown_tx,
                finished: finished_rx,
            },
        );
        let total = self.inner.total_sessions.fetch_add(1, Ordering::Relaxed) + 1;

        // A shutdown may have started between the check and the insert.
        if self.inner.closing.load(Ordering::Acquire) {
            if let Some(entry) = self.inner.sessions.get(&id) {
                let _ = entry.shutdown.send(true);
            }
        }

        debug!(session_id = %id, active = self.len(), total, "session registered");
        Some(SessionRegistration {
            id,
            shutdown: shutdown_rx,
            guard: SessionGuard {
                id,
                registry: self.clone(),
                finished: finished_tx,
            },
        })
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn total_sessions(&self) -> u64 {
        self.inner.total_sessions.load(Ordering::Relaxed)
    }

    /// Signals every session and waits, at most `grace` overall, for each to finish.
    /// Returns the number of sessions that were still running when the wait gave up.
    pub async fn shutdown_all(&self, grace: Duration) -> usize {
        let waiting = self.signal_all();
        debug!(sessions = waiting.len(), "shutting down sessions");

        let deadline = tokio::time::Instant::now() + grace;
        let mut stragglers = 0;
        for (id, mut finished) in waiting {
            let done = tokio::time::timeout_at(deadline, finished.wait_for(|done| *done)).await;
            // A closed channel means the guard is gone, which also counts as finished.
            if done.is_err() {
                warn!(session_id = %id, "session did not finish before shutdown deadline");
                stragglers += 1;
            }
        }
        stragglers
    }

    /// Refuses new sessions and asks every live one to stop, without waiting.
    pub fn signal_all(&self) -> Vec<(Uuid, watch::Receiver<bool>)> {
        self.inner.closing.store(true, Ordering::Release);
        self.inner
            .sessions
            .iter()
            .map(|entry| {
                let _ = entry.shutdown.send(true);
                (*entry.key(), entry.finished.clone())
            })
            .collect()
    }

    fn remove(&self, id: Uuid) -> SessionRemoval {
        self.inner.sessions.remove(&id);
        SessionRemoval {
            active_sessions: self.len(),
            total_sessions: self.total_sessions(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let removal = self.registry.remove(self.id);
        let _ = self.finished.send(true);
        debug!(
            session_id = %self.id,
            active = removal.active_sessions,
            total = removal.total_sessions,
            "session unregistered"
        );
    }
}
