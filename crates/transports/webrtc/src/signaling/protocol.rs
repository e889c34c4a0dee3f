//! Relay signaling wire format
//!
//! One JSON object per WebSocket text frame. The relay forwards objects
//! verbatim to the other participant of the room, so the shape follows the
//! browser conventions (`type`/`sdp` descriptions, `sdpMid`/`sdpMLineIndex`
//! candidates):
//!
//! ```text
//! {"join": true, "userName": "alice"}
//! {"offer": {"type": "offer", "sdp": "v=0..."}}
//! {"answer": {"type": "answer", "sdp": "v=0..."}}
//! {"iceCandidate": {"candidate": "candidate:...", "sdpMid": "0", "sdpMLineIndex": 0}}
//! {"leave": true}
//! {"type": "ping"} / {"type": "pong"}
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// SDP description kind carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,

    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Announce presence in the room
    Join { user_name: String },
    /// Negotiation offer
    Offer(SessionDescription),
    /// Negotiation answer
    Answer(SessionDescription),
    /// Network-path candidate
    IceCandidate(IceCandidate),
    /// Peer departure notice
    Leave,
    /// Heartbeat request
    Ping,
    /// Heartbeat reply
    Pong,
}

/// Flat JSON shape of every relay message
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join: Option<bool>,

    #[serde(rename = "userName", default, skip_serializing_if = "Option::is_none")]
    user_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer: Option<SessionDescription>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<SessionDescription>,

    #[serde(rename = "iceCandidate", default, skip_serializing_if = "Option::is_none")]
    ice_candidate: Option<IceCandidate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    leave: Option<bool>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
}

impl SignalingMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::IceCandidate(_) => "ice_candidate",
            SignalingMessage::Leave => "leave",
            SignalingMessage::Ping => "ping",
            SignalingMessage::Pong => "pong",
        }
    }

    /// Heartbeat traffic is never buffered or forwarded to the session
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, SignalingMessage::Ping | SignalingMessage::Pong)
    }

    /// Convert message to JSON string
    pub fn to_json(&self) -> Result<String> {
        let wire = match self.clone() {
            SignalingMessage::Join { user_name } => WireMessage {
                join: Some(true),
                user_name: Some(user_name),
                ..Default::default()
            },
            SignalingMessage::Offer(desc) => WireMessage {
                offer: Some(desc),
                ..Default::default()
            },
            SignalingMessage::Answer(desc) => WireMessage {
                answer: Some(desc),
                ..Default::default()
            },
            SignalingMessage::IceCandidate(candidate) => WireMessage {
                ice_candidate: Some(candidate),
                ..Default::default()
            },
            SignalingMessage::Leave => WireMessage {
                leave: Some(true),
                ..Default::default()
            },
            SignalingMessage::Ping => WireMessage {
                kind: Some("ping".to_string()),
                ..Default::default()
            },
            SignalingMessage::Pong => WireMessage {
                kind: Some("pong".to_string()),
                ..Default::default()
            },
        };

        serde_json::to_string(&wire).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize signaling message: {}", e))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let wire: WireMessage = serde_json::from_str(json).map_err(|e| {
            Error::SerializationError(format!("Failed to deserialize signaling message: {}", e))
        })?;

        if let Some(desc) = wire.offer {
            return Ok(SignalingMessage::Offer(desc));
        }
        if let Some(desc) = wire.answer {
            return Ok(SignalingMessage::Answer(desc));
        }
        if let Some(candidate) = wire.ice_candidate {
            return Ok(SignalingMessage::IceCandidate(candidate));
        }
        if wire.join == Some(true) {
            return Ok(SignalingMessage::Join {
                user_name: wire.user_name.unwrap_or_default(),
            });
        }
        if wire.leave == Some(true) {
            return Ok(SignalingMessage::Leave);
        }

        match wire.kind.as_deref() {
            Some("ping") => Ok(SignalingMessage::Ping),
            Some("pong") => Ok(SignalingMessage::Pong),
            Some(other) => Err(Error::InvalidData(format!(
                "Unknown signaling message type: {}",
                other
            ))),
            None => Err(Error::InvalidData(format!(
                "Unrecognised signaling message: {}",
                json
            ))),
        }
    }
}
