//! Configuration types for room call sessions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Participant role, fixed for the lifetime of a session
///
/// The role decides the perfect-negotiation behaviour: the Host is the
/// impolite peer (ignores colliding offers), the Guest is the polite peer
/// (rolls back its own offer and accepts the remote one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Participant that opened the room
    Host,
    /// Participant that joined an existing room
    Guest,
}

impl Role {
    /// Whether this role yields on offer collisions
    pub fn is_polite(&self) -> bool {
        matches!(self, Role::Guest)
    }

    /// Whether this role opens the chat data channel
    pub fn creates_data_channel(&self) -> bool {
        matches!(self, Role::Host)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Guest => write!(f, "guest"),
        }
    }
}

/// Main configuration for a RoomSession
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Relay base URL (ws:// or wss://); `/join-room` is appended
    pub signaling_url: String,

    /// Room identifier shared by both participants
    pub room_id: String,

    /// Name announced to the relay on every (re)connect
    pub display_name: String,

    /// Host or Guest
    pub role: Role,

    /// Capture and send microphone audio
    pub audio_enabled: bool,

    /// Capture and send camera video
    pub video_enabled: bool,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional fallback relays)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Chat data channel settings
    pub data_channel: DataChannelConfig,

    /// Timer settings
    pub timing: TimingOptions,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Chat data channel settings
///
/// The channel is ordered and retransmission-limited: the transport retries
/// a message at most `max_retransmits` times before giving up on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChannelConfig {
    /// Channel label
    pub label: String,

    /// In-order delivery
    pub ordered: bool,

    /// Retransmission limit
    pub max_retransmits: u16,
}

/// Timer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingOptions {
    /// Relay heartbeat interval in milliseconds (default: 30000)
    pub heartbeat_interval_ms: u64,

    /// Statistics polling interval in milliseconds (default: 5000)
    pub stats_interval_ms: u64,

    /// Delay between teardown and rebuild of a failed connection (default: 2000)
    pub rebuild_delay_ms: u64,

    /// Lower bound of the relay reconnect delay (default: 1000)
    pub reconnect_base_ms: u64,

    /// Upper bound of the relay reconnect delay (default: 10000)
    pub reconnect_max_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080".to_string(),
            room_id: String::new(),
            display_name: "anonymous".to_string(),
            role: Role::Host,
            audio_enabled: true,
            video_enabled: true,
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            data_channel: DataChannelConfig::default(),
            timing: TimingOptions::default(),
        }
    }
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            label: "chat".to_string(),
            ordered: true,
            max_retransmits: 3,
        }
    }
}

impl Default for TimingOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            stats_interval_ms: 5_000,
            rebuild_delay_ms: 2_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 10_000,
        }
    }
}

impl TimingOptions {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn rebuild_delay(&self) -> Duration {
        Duration::from_millis(self.rebuild_delay_ms)
    }
}

impl SessionConfig {
    /// Create a configuration for joining `room_id` with the given role
    pub fn new(signaling_url: &str, room_id: &str, display_name: &str, role: Role) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
            role,
            ..Default::default()
        }
    }

    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::InvalidConfig(format!("Failed to parse session config: {}", e))
        })
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a ws:// or wss:// URL
    /// - `room_id` or `display_name` is empty
    /// - a STUN or TURN URL has the wrong scheme
    /// - the data channel label is empty
    /// - any interval is zero, or the reconnect bounds are inverted
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.room_id.trim().is_empty() {
            return Err(Error::InvalidConfig("room_id must not be empty".to_string()));
        }

        if self.display_name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "display_name must not be empty".to_string(),
            ));
        }

        if let Some(bad) = self
            .stun_servers
            .iter()
            .find(|url| !url.starts_with("stun:") && !url.starts_with("stuns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "STUN server must start with stun: or stuns:, got {}",
                bad
            )));
        }

        if let Some(bad) = self
            .turn_servers
            .iter()
            .find(|turn| !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "TURN server must start with turn: or turns:, got {}",
                bad.url
            )));
        }

        if self.data_channel.label.is_empty() {
            return Err(Error::InvalidConfig(
                "data channel label must not be empty".to_string(),
            ));
        }

        let timing = &self.timing;
        if timing.heartbeat_interval_ms == 0
            || timing.stats_interval_ms == 0
            || timing.reconnect_base_ms == 0
        {
            return Err(Error::InvalidConfig(
                "heartbeat, stats and reconnect intervals must be non-zero".to_string(),
            ));
        }

        if timing.reconnect_base_ms > timing.reconnect_max_ms {
            return Err(Error::InvalidConfig(format!(
                "reconnect_base_ms ({}) must not exceed reconnect_max_ms ({})",
                timing.reconnect_base_ms, timing.reconnect_max_ms
            )));
        }

        Ok(())
    }
}
