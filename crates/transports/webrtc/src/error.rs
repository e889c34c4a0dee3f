//! Error types for room call sessions

/// Result type alias using the crate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while setting up or maintaining a room call
///
/// Relay outages are not errors: the signaling client retries them in the
/// background and reports them through its transport state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected session configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Creating, applying or answering a session description failed
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Negotiation state machine rejected a transition
    #[error("Invalid negotiation transition: {event} in state {state}")]
    InvalidTransition {
        /// State the machine was in
        state: String,
        /// Event that was rejected
        event: String,
    },

    /// A remote candidate could not be applied
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Building, configuring or closing the peer connection failed
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Microphone or camera could not be acquired
    #[error("Media capture failed: {0}")]
    MediaCapture(String),

    /// Relay frame that is not a known signaling message
    #[error("Invalid signaling message: {0}")]
    InvalidData(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Session already torn down
    #[error("Session closed")]
    SessionClosed,

    /// Failure reported by webrtc-rs outside the categories above
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether rebuilding the peer connection may clear this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PeerConnectionError(_)
                | Error::DataChannelError(_)
                | Error::WebRtcError(_)
                | Error::IoError(_)
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Whether this error came out of offer/answer or candidate handling
    pub fn is_negotiation_error(&self) -> bool {
        matches!(
            self,
            Error::SdpError(_) | Error::InvalidTransition { .. } | Error::IceCandidateError(_)
        )
    }
}
