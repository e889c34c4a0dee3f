//! Relay reconnection delay policy

use crate::config::TimingOptions;
use rand::Rng;
use std::time::Duration;

/// Reconnection policy for the relay transport
///
/// Delays are randomized and bounded: every delay lies within
/// `[base, max]`, and the upper end of the random range doubles with each
/// consecutive failure until it reaches `max`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Smallest delay (default: 1s)
    pub base: Duration,
    /// Largest delay (default: 10s)
    pub max: Duration,
    /// Randomize within the window (default: true)
    pub jitter_enabled: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter_enabled: true,
        }
    }
}

impl From<&TimingOptions> for ReconnectPolicy {
    fn from(timing: &TimingOptions) -> Self {
        Self {
            base: Duration::from_millis(timing.reconnect_base_ms),
            max: Duration::from_millis(timing.reconnect_max_ms.max(timing.reconnect_base_ms)),
            jitter_enabled: true,
        }
    }
}

impl ReconnectPolicy {
    /// Upper end of the delay window after `failures` consecutive failures
    pub fn ceiling(&self, failures: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let exponent = failures.saturating_sub(1).min(16);
        let ceiling_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(ceiling_ms.clamp(base_ms, max_ms.max(base_ms)))
    }

    /// Delay before the next attempt after `failures` consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        let floor = self.base;
        let ceiling = self.ceiling(failures);

        if !self.jitter_enabled || ceiling <= floor {
            return ceiling;
        }

        let ms = rand::thread_rng().gen_range(floor.as_millis() as u64..=ceiling.as_millis() as u64);
        Duration::from_millis(ms)
    }
}
