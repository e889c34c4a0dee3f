//! Room call integration test harness
//!
//! Provides:
//! - An embedded relay on a random port ([`TestRelay`])
//! - Session configs pointing at it, tuned for fast retries
//! - Polling helpers with timeouts
//!
//! Basic usage pattern:
//!
//! 1. Start a `TestRelay`
//! 2. Build configs with [`config_for`] and start clients or sessions
//! 3. Drive the relay (inject messages, cut connections)
//! 4. Assert with [`wait_until`] and the relay's recorded traffic

#![allow(dead_code)]

pub mod relay;

use roomcall_webrtc::{Role, SessionConfig, SignalingMessage};
use std::future::Future;
use std::time::Duration;

pub use relay::{Recorded, TestRelay};

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Relay error: {0}")]
    RelayError(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Initialize logging once per test binary
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcall_webrtc=debug,info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Session config for `relay` with short timers and no external ICE servers
pub fn config_for(relay: &TestRelay, room_id: &str, name: &str, role: Role) -> SessionConfig {
    let mut config = SessionConfig::new(&relay.url(), room_id, name, role);
    config.stun_servers = Vec::new();
    config.audio_enabled = false;
    config.video_enabled = false;
    config.timing.reconnect_base_ms = 50;
    config.timing.reconnect_max_ms = 200;
    config.timing.rebuild_delay_ms = 200;
    config
}

/// Poll `condition` every 20ms until it holds or `timeout` elapses
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F) -> HarnessResult<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return Err(HarnessError::Timeout(what.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Async variant of [`wait_until`]
pub async fn wait_until_async<F, Fut>(
    what: &str,
    timeout: Duration,
    mut condition: F,
) -> HarnessResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition().await {
        if tokio::time::Instant::now() >= deadline {
            return Err(HarnessError::Timeout(what.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Kinds of the recorded messages, e.g. `["join", "offer"]`
pub fn kinds(recorded: &[Recorded]) -> Vec<&'static str> {
    recorded.iter().map(|r| r.message.kind()).collect()
}

pub fn is_join(message: &SignalingMessage) -> bool {
    matches!(message, SignalingMessage::Join { .. })
}
