//! Connection statistics snapshot

use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Transport statistics captured by one poll
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    /// Bytes received over the selected candidate pair
    pub bytes_received: u64,
    /// Bytes sent over the selected candidate pair
    pub bytes_sent: u64,
    /// Packets the remote side reported lost
    pub packets_lost: u64,
    /// Current round-trip time, if measured yet
    pub round_trip_time: Option<Duration>,
    /// When this snapshot was taken
    #[serde(skip)]
    pub captured_at: Instant,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            bytes_received: 0,
            bytes_sent: 0,
            packets_lost: 0,
            round_trip_time: None,
            captured_at: Instant::now(),
        }
    }
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Round-trip time in milliseconds, 0 when unknown
    pub fn round_trip_ms(&self) -> f64 {
        self.round_trip_time
            .map(|rtt| rtt.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

/// Anything that can produce a statistics snapshot
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn collect_stats(&self) -> Result<ConnectionStats>;
}
