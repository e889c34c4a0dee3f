//! Connection health: state observation and periodic statistics

mod monitor;
mod stats;

pub use monitor::{ConnectionHealthMonitor, HealthAction};
pub use stats::{ConnectionStats, StatsSource};
