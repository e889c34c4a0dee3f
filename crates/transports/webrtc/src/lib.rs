//! Two-party WebRTC room calls
//!
//! A participant joins a room through a WebSocket relay, negotiates a single
//! peer connection with the other participant using perfect negotiation, and
//! exchanges audio/video plus chat text over an ordered data channel. Broken
//! relay links and failed peer connections recover on their own.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  RoomSession                                             │
//! │  ├─ SignalingClient (reconnecting, buffering, heartbeat) │
//! │  ├─ Negotiator                                           │
//! │  │   ├─ NegotiationStateMachine (Host impolite,         │
//! │  │   │                           Guest polite)          │
//! │  │   └─ IceCandidateQueue                                │
//! │  ├─ RtcPeer (webrtc-rs connection, tracks, channel)      │
//! │  ├─ DataChannelBridge (chat send / subscribe)            │
//! │  ├─ ConnectionHealthMonitor (periodic stats)             │
//! │  └─ ReconnectionController (delayed single-flight       │
//! │                             rebuild)                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use roomcall_webrtc::{Role, SessionConfig};
//!
//! let config = SessionConfig::new("ws://localhost:8080", "room-42", "alice", Role::Host);
//! assert!(config.validate().is_ok());
//! assert!(!config.role.is_polite());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use roomcall_webrtc::{RoomSession, Role, SampleTrackDevice, SessionConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> roomcall_webrtc::Result<()> {
//! let config = SessionConfig::new("ws://localhost:8080", "room-42", "bob", Role::Guest);
//! let session = RoomSession::start(config, Arc::new(SampleTrackDevice::default())).await?;
//!
//! let _subscription = session.subscribe(|text| println!("peer: {}", text));
//! session.send_message("hello").await;
//!
//! session.leave().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod error;
pub mod health;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod reconnect;
pub mod session;
pub mod signaling;

pub use channels::{DataChannelBridge, Subscription};
pub use config::{DataChannelConfig, Role, SessionConfig, TimingOptions, TurnServerConfig};
pub use error::{Error, Result};
pub use health::{ConnectionHealthMonitor, ConnectionStats};
pub use media::{CaptureDevice, LocalMedia, MediaKind, SampleTrackDevice};
pub use negotiation::{NegotiationState, NegotiationStateMachine, Politeness};
pub use peer::{ConnectionState, IceConnectionState};
pub use reconnect::ReconnectionController;
pub use session::{RoomSession, SessionSnapshot};
pub use signaling::{SignalingClient, SignalingMessage, TransportState};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
