//! WebRTC peer connection management
//!
//! Wraps the webrtc-rs connection: descriptions, candidates, media tracks,
//! the application data channel and statistics.

mod connection;
mod state;

pub use connection::{PeerEvent, PeerEventSender, RtcPeer};
pub use state::{ConnectionState, IceConnectionState};
