//! Client registry and idle-shutdown scheduler.
//!
//! The manager bounds how many clients may be connected at once and drives
//! the process-level idle policy: once there are simultaneously no connected
//! clients and no running sessions for the grace period, the injected idle
//! sink fires. The sink is the only place the core may trigger process exit,
//! and it is a no-op in tests.
//!
//! The timer is armed on every client disconnect and on every store `Idle`
//! emission, cancelled by any admission or store `Active`, and re-verifies
//! the idle condition when it fires.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::session::{SessionStore, StoreEvent};

/// Grace period the idle condition must hold before the sink fires.
pub const IDLE_GRACE: Duration = Duration::from_secs(5);

/// How long shutdown waits for client tasks to close their sockets before
/// the store is torn down anyway.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Action invoked when the idle grace period elapses.
pub type IdleSink = Box<dyn Fn() + Send + Sync>;

/// Admission failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("client capacity reached ({0})")]
    CapacityReached(usize),
}

struct ManagerInner {
    clients: DashMap<String, ()>,
    max_clients: usize,
    store: SessionStore,
    idle_grace: Duration,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    on_idle: IdleSink,
    shutdown_tx: broadcast::Sender<()>,
}

/// Cheaply clonable handle to the client registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

/// RAII registration of one connected client; dropping it deregisters the
/// client and re-checks the idle condition.
pub struct ClientGuard {
    manager: SessionManager,
    id: String,
}

impl ClientGuard {
    /// The client's freshly allocated opaque id.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.manager.inner.clients.remove(&self.id);
        tracing::debug!(client_id = %self.id, "client deregistered");
        self.manager.check_idle();
    }
}

impl SessionManager {
    /// Creates a manager over `store` with the given client cap and idle sink.
    pub fn new(store: SessionStore, max_clients: usize, on_idle: IdleSink) -> Self {
        Self::with_idle_grace(store, max_clients, IDLE_GRACE, on_idle)
    }

    /// Like [`SessionManager::new`] with an explicit grace period.
    pub fn with_idle_grace(
        store: SessionStore,
        max_clients: usize,
        idle_grace: Duration,
        on_idle: IdleSink,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(ManagerInner {
                clients: DashMap::new(),
                max_clients,
                store,
                idle_grace,
                idle_timer: Mutex::new(None),
                on_idle,
                shutdown_tx,
            }),
        }
    }

    /// Starts the store-event watcher that cancels the timer on `Active` and
    /// re-checks idleness on `Idle`.
    pub fn start(&self) {
        let manager = self.clone();
        let mut events = self.inner.store.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::Active) => manager.cancel_idle_timer(),
                    Ok(StoreEvent::Idle) => manager.check_idle(),
                    Ok(StoreEvent::SessionRemoved { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Admits a new client, or rejects it when the cap is reached.
    /// Admission cancels any pending idle timer.
    pub fn register(&self) -> Result<ClientGuard, AdmissionError> {
        if self.inner.clients.len() >= self.inner.max_clients {
            return Err(AdmissionError::CapacityReached(self.inner.max_clients));
        }
        let id = Uuid::new_v4().to_string();
        self.inner.clients.insert(id.clone(), ());
        self.cancel_idle_timer();
        tracing::debug!(client_id = %id, clients = self.client_count(), "client admitted");
        Ok(ClientGuard {
            manager: self.clone(),
            id,
        })
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Receiver signalled once when the manager shuts down.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Arms the idle timer iff nothing is connected and nothing is running.
    pub fn check_idle(&self) {
        if self.client_count() == 0 && self.inner.store.running_count() == 0 {
            self.arm_idle_timer();
        }
    }

    /// Cancels any pending idle timer.
    pub fn cancel_idle_timer(&self) {
        let mut slot = self.inner.idle_timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
            tracing::debug!("idle timer cancelled");
        }
    }

    /// Closes every client, waits for them to drain, then shuts the store
    /// down.
    ///
    /// Sessions are killed only once the clients are gone (or a bounded wait
    /// elapses), so a graceful shutdown reaches viewers as a close frame and
    /// never as a session exit.
    pub async fn shutdown(&self) {
        self.cancel_idle_timer();
        let _ = self.inner.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while self.client_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.client_count() > 0 {
            tracing::warn!(
                clients = self.client_count(),
                "shutdown drain timed out, closing sessions anyway"
            );
        }

        // Disconnecting clients may have re-armed the idle timer.
        self.cancel_idle_timer();
        self.inner.store.shutdown();
        tracing::info!("session manager shut down");
    }

    fn arm_idle_timer(&self) {
        let mut slot = self.inner.idle_timer.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let manager = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(manager.inner.idle_grace).await;

            // The condition must still hold after the grace period.
            if manager.client_count() == 0 && manager.inner.store.running_count() == 0 {
                tracing::info!(
                    grace_secs = manager.inner.idle_grace.as_secs_f64(),
                    "idle grace period elapsed"
                );
                (manager.inner.on_idle)();
            }

            let mut slot = manager
                .inner
                .idle_timer
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *slot = None;
        }));
        tracing::debug!("idle timer armed");
    }
}
