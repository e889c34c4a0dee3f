//! Peer connection rebuild after failure
//!
//! At most one rebuild runs at a time. A rebuild tears the connection down
//! immediately, waits a fixed delay so transient network blips settle, then
//! builds a fresh connection. On the polite side the fresh connection
//! re-initiates negotiation; the impolite side waits for the offer.

use crate::config::Role;
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Steps of a rebuild, provided by the session
#[async_trait]
pub trait PeerLifecycle: Send + Sync {
    /// Close the peer connection and drop everything bound to it
    async fn teardown(&self);

    /// Create a fresh peer connection
    async fn rebuild(&self) -> Result<()>;

    /// Start negotiation on the fresh connection
    async fn renegotiate(&self) -> Result<()>;
}

struct ControllerState {
    in_flight: AtomicBool,
    reconnecting_tx: watch::Sender<bool>,
}

/// Single-flight teardown/rebuild of the peer connection
pub struct ReconnectionController {
    lifecycle: Weak<dyn PeerLifecycle>,
    role: Role,
    rebuild_delay: Duration,
    state: Arc<ControllerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectionController {
    pub fn new(lifecycle: Weak<dyn PeerLifecycle>, role: Role, rebuild_delay: Duration) -> Self {
        let (reconnecting_tx, _) = watch::channel(false);
        Self {
            lifecycle,
            role,
            rebuild_delay,
            state: Arc::new(ControllerState {
                in_flight: AtomicBool::new(false),
                reconnecting_tx,
            }),
            task: Mutex::new(None),
        }
    }

    /// Start a rebuild unless one is already running
    ///
    /// Returns `false` when the request was ignored.
    pub fn trigger(&self, reason: &str) -> bool {
        if self
            .state
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(reason, "Rebuild already in progress, ignoring request");
            return false;
        }

        if self.lifecycle.upgrade().is_none() {
            self.state.in_flight.store(false, Ordering::SeqCst);
            debug!(reason, "Session gone, not rebuilding");
            return false;
        }

        info!(reason, delay = ?self.rebuild_delay, "Rebuilding peer connection");
        self.state.reconnecting_tx.send_replace(true);

        let task = tokio::spawn(run_rebuild(
            self.lifecycle.clone(),
            self.state.clone(),
            self.role,
            self.rebuild_delay,
        ));

        if let Ok(mut slot) = self.task.lock() {
            if let Some(previous) = slot.replace(task) {
                // Finished rebuilds leave their handle behind
                previous.abort();
            }
        }
        true
    }

    /// Manual rebuild request
    pub fn reconnect(&self) -> bool {
        self.trigger("manual reconnect")
    }

    /// Abort any running rebuild and clear the reconnecting flag
    pub fn cancel(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        self.state.in_flight.store(false, Ordering::SeqCst);
        self.state.reconnecting_tx.send_replace(false);
    }

    /// The rebuilt connection came up
    pub fn mark_connected(&self) {
        if self.state.reconnecting_tx.send_replace(false) {
            info!("Peer connection recovered");
        }
    }

    pub fn in_flight(&self) -> bool {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// A rebuild is running or the rebuilt connection is not up yet
    pub fn is_reconnecting(&self) -> bool {
        *self.state.reconnecting_tx.borrow()
    }

    pub fn watch_reconnecting(&self) -> watch::Receiver<bool> {
        self.state.reconnecting_tx.subscribe()
    }
}

impl Drop for ReconnectionController {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

async fn run_rebuild(
    lifecycle: Weak<dyn PeerLifecycle>,
    state: Arc<ControllerState>,
    role: Role,
    delay: Duration,
) {
    if let Some(lifecycle) = lifecycle.upgrade() {
        lifecycle.teardown().await;
    }

    tokio::time::sleep(delay).await;

    let Some(lifecycle) = lifecycle.upgrade() else {
        state.in_flight.store(false, Ordering::SeqCst);
        return;
    };

    match lifecycle.rebuild().await {
        Ok(()) if role.is_polite() => {
            debug!("Rebuilt peer connection, re-initiating negotiation");
            if let Err(e) = lifecycle.renegotiate().await {
                warn!("Renegotiation after rebuild failed: {}", e);
            }
        }
        Ok(()) => debug!("Rebuilt peer connection, waiting for remote offer"),
        Err(e) => error!("Failed to rebuild peer connection: {}", e),
    }

    state.in_flight.store(false, Ordering::SeqCst);
}
