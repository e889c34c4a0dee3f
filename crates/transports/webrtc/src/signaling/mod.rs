//! Relay signaling: wire protocol and the reconnecting WebSocket client

pub mod client;
pub mod protocol;

pub use client::{join_room_url, SignalingClient, TransportState};
pub use protocol::{IceCandidate, SdpKind, SessionDescription, SignalingMessage};

/// Outbound half of the signaling path
///
/// Sending never fails from the caller's point of view: implementations
/// buffer or drop (with a log line) instead of returning errors.
pub trait SignalingSink: Send + Sync {
    fn send(&self, message: SignalingMessage);
}
