//! Room call session
//!
//! [`RoomSession`] ties the relay client, the peer connection, the chat
//! channel, health monitoring and recovery together for one participant.

mod room;

pub use room::RoomSession;

use crate::config::{Role, SessionConfig};
use crate::peer::{ConnectionState, IceConnectionState};
use serde::Serialize;

/// Observable session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub room_id: String,
    pub display_name: String,
    pub role: Role,
    pub connection_state: ConnectionState,
    pub ice_connection_state: IceConnectionState,
    pub data_channel_open: bool,
    /// Relay reconnecting, or a peer rebuild not yet connected
    pub is_reconnecting: bool,
}

impl SessionSnapshot {
    pub(crate) fn initial(config: &SessionConfig) -> Self {
        Self {
            room_id: config.room_id.clone(),
            display_name: config.display_name.clone(),
            role: config.role,
            connection_state: ConnectionState::New,
            ice_connection_state: IceConnectionState::New,
            data_channel_open: false,
            is_reconnecting: false,
        }
    }
}
