//! Connection health monitor

use super::stats::{ConnectionStats, StatsSource};
use crate::peer::{ConnectionState, IceConnectionState};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reaction to a connection or ICE state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// Connection is up: start periodic stats collection
    StartPolling,
    /// Connection is lost: hand over to the reconnection controller
    Recover,
    /// Nothing to do
    None,
}

/// Watches peer state and polls transport statistics
pub struct ConnectionHealthMonitor {
    interval: Duration,
    stats_tx: watch::Sender<Option<ConnectionStats>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHealthMonitor {
    pub fn new(interval: Duration) -> Self {
        let (stats_tx, _) = watch::channel(None);
        Self {
            interval,
            stats_tx,
            poller: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn observe_connection(&self, state: ConnectionState) -> HealthAction {
        match state {
            ConnectionState::Connected => HealthAction::StartPolling,
            ConnectionState::Disconnected | ConnectionState::Failed => {
                warn!("Peer connection {}", state);
                HealthAction::Recover
            }
            _ => HealthAction::None,
        }
    }

    pub fn observe_ice(&self, state: IceConnectionState) -> HealthAction {
        match state {
            s if s.is_connected() => HealthAction::StartPolling,
            IceConnectionState::Disconnected | IceConnectionState::Failed => {
                warn!("ICE connection {}", state);
                HealthAction::Recover
            }
            _ => HealthAction::None,
        }
    }

    /// Start polling `source`, replacing any running poller
    pub fn start_polling(&self, source: Arc<dyn StatsSource>) {
        let interval = self.interval;
        let stats_tx = self.stats_tx.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match source.collect_stats().await {
                    Ok(stats) => {
                        debug!(
                            bytes_sent = stats.bytes_sent,
                            bytes_received = stats.bytes_received,
                            packets_lost = stats.packets_lost,
                            rtt_ms = stats.round_trip_ms(),
                            "Connection stats"
                        );
                        stats_tx.send_replace(Some(stats));
                    }
                    Err(e) => debug!("Stats collection failed: {}", e),
                }
            }
        });

        if let Ok(mut poller) = self.poller.lock() {
            if let Some(previous) = poller.replace(task) {
                previous.abort();
            } else {
                info!("Stats polling started (every {:?})", interval);
            }
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .map(|poller| poller.is_some())
            .unwrap_or(false)
    }

    /// Stop polling; the last snapshot stays readable
    pub fn stop(&self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(task) = poller.take() {
                task.abort();
                debug!("Stats polling stopped");
            }
        }
    }

    pub fn latest(&self) -> Option<ConnectionStats> {
        self.stats_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<ConnectionStats>> {
        self.stats_tx.subscribe()
    }
}

impl Drop for ConnectionHealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
