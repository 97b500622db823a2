//! Process-wide registry of managed PTY sessions.
//!
//! The store announces population changes over a broadcast channel: `Active`
//! on every create, `Idle` when the last running session exits naturally, and
//! `SessionRemoved` on explicit removal. Deliberate removal never emits
//! `Idle`, so it cannot race the idle-shutdown timer.
//!
//! Exited sessions stay registered so a late lister still sees their
//! `exited` status; they leave only via [`SessionStore::remove`] or
//! [`SessionStore::shutdown`].

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::pty::{
    PtySession, SessionError, SessionEvent, SessionId, SpawnCommand, SpawnOptions,
};
use super::ring::DEFAULT_MAX_BUFFER_BYTES;
use protocol::{SessionInfo, SessionSource};

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 64;

/// Lifecycle signals emitted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A session was created.
    Active,
    /// The running count reached zero through a natural child exit.
    Idle,
    /// A session was explicitly removed from the store.
    SessionRemoved { id: SessionId },
}

/// Options for creating a managed session.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub name: String,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    /// Explicit id; defaults to a fresh UUID.
    pub id: Option<String>,
    /// Ring capacity override in bytes.
    pub max_buffer_bytes: Option<usize>,
    /// Extra environment entries for the child.
    pub env: Vec<(String, String)>,
}

struct StoreInner {
    sessions: DashMap<SessionId, Arc<PtySession>>,
    events_tx: broadcast::Sender<StoreEvent>,
    default_max_buffer_bytes: usize,
}

/// Cheaply clonable handle to the session registry.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    /// Creates an empty store using the default per-session ring capacity.
    pub fn new() -> Self {
        Self::with_max_buffer_bytes(DEFAULT_MAX_BUFFER_BYTES)
    }

    /// Creates an empty store with a configured per-session ring capacity.
    pub fn with_max_buffer_bytes(default_max_buffer_bytes: usize) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                sessions: DashMap::new(),
                events_tx,
                default_max_buffer_bytes,
            }),
        }
    }

    /// Subscribes to lifecycle signals.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Spawns and registers a new managed session, emitting `Active`.
    ///
    /// The session's exit is hooked so that a natural child exit which brings
    /// the running count to zero emits `Idle`, but only while the session is
    /// still registered; explicit removal therefore stays silent.
    pub fn create(&self, options: CreateOptions) -> Result<Arc<PtySession>, SessionError> {
        let session = PtySession::spawn(SpawnOptions {
            name: options.name,
            command: SpawnCommand::Shell(options.shell),
            cols: options.cols,
            rows: options.rows,
            id: options.id,
            max_buffer_bytes: Some(
                options
                    .max_buffer_bytes
                    .unwrap_or(self.inner.default_max_buffer_bytes),
            ),
            env: options.env,
            source: SessionSource::Managed,
        })?;

        let events = session.subscribe();
        self.inner
            .sessions
            .insert(session.id().clone(), Arc::clone(&session));
        self.spawn_exit_watcher(Arc::clone(&session), events);

        let _ = self.inner.events_tx.send(StoreEvent::Active);
        Ok(session)
    }

    /// Looks up a session by id.
    pub fn get(&self, id: &str) -> Option<Arc<PtySession>> {
        self.inner.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    /// All registered sessions. Order carries no meaning.
    pub fn list(&self) -> Vec<Arc<PtySession>> {
        self.inner
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Listing entries for all registered sessions.
    pub fn list_info(&self) -> Vec<SessionInfo> {
        self.inner.sessions.iter().map(|e| e.value().info()).collect()
    }

    /// Kills and deregisters a session. Returns whether it existed.
    ///
    /// Emits `SessionRemoved` but never `Idle`.
    pub fn remove(&self, id: &str) -> bool {
        match self.inner.sessions.remove(id) {
            Some((id, session)) => {
                session.kill();
                let _ = self
                    .inner
                    .events_tx
                    .send(StoreEvent::SessionRemoved { id: id.clone() });
                tracing::info!(session_id = %id, "session removed from store");
                true
            }
            None => false,
        }
    }

    /// Number of sessions whose child is still running.
    pub fn running_count(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|e| !e.value().has_exited())
            .count()
    }

    /// Number of registered sessions, exited ones included.
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether the store holds no sessions at all.
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Kills and drops every session. Idempotent; emits no signals.
    pub fn shutdown(&self) {
        let ids: Vec<SessionId> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if let Some((_, session)) = self.inner.sessions.remove(&id) {
                session.kill();
            }
        }
        tracing::info!("session store shut down");
    }

    fn spawn_exit_watcher(
        &self,
        session: Arc<PtySession>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) {
        let store = self.clone();
        tokio::spawn(async move {
            // The child may have exited before this task got to run.
            if !session.has_exited() {
                loop {
                    match events.recv().await {
                        Ok(SessionEvent::Exit(_)) => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            store.note_exit(session.id());
        });
    }

    /// Emits `Idle` iff the exited session is still registered (a natural
    /// exit, not a removal) and nothing else is running.
    fn note_exit(&self, id: &str) {
        if self.inner.sessions.contains_key(id) && self.running_count() == 0 {
            let _ = self.inner.events_tx.send(StoreEvent::Idle);
            tracing::debug!(session_id = %id, "store idle");
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
