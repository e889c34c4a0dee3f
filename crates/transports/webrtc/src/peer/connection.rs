//! WebRTC peer connection management

use super::state::{ConnectionState, IceConnectionState};
use crate::config::{DataChannelConfig, SessionConfig};
use crate::health::{ConnectionStats, StatsSource};
use crate::media::LocalMedia;
use crate::negotiation::PeerHandle;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

/// Events raised by a peer connection
pub enum PeerEvent {
    /// Local candidate to forward to the remote participant
    IceCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    IceConnectionState(IceConnectionState),
    NegotiationNeeded,
    /// Channel opened by the remote participant
    DataChannel(Arc<RTCDataChannel>),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(&c.candidate).finish(),
            PeerEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            PeerEvent::IceConnectionState(s) => {
                f.debug_tuple("IceConnectionState").field(s).finish()
            }
            PeerEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            PeerEvent::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
        }
    }
}

/// Peer events tagged with the generation of the connection that raised them
pub type PeerEventSender = mpsc::UnboundedSender<(u64, PeerEvent)>;

/// One WebRTC peer connection
///
/// A session replaces the whole `RtcPeer` on every rebuild; the generation
/// distinguishes events of the current connection from late ones.
pub struct RtcPeer {
    generation: u64,
    connection_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    /// Retained so attached tracks stay alive
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl RtcPeer {
    /// Create a new peer connection
    ///
    /// # Arguments
    ///
    /// * `config` - STUN/TURN servers
    /// * `generation` - Tag attached to every event
    /// * `events` - Receiver side is owned by the session
    #[instrument(skip(config, events), fields(room_id = %config.room_id))]
    pub async fn new(config: &SessionConfig, generation: u64, events: PeerEventSender) -> Result<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();

        info!(
            "Creating peer connection: generation={}, connection_id={}",
            generation, connection_id
        );

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
            })?);

        let peer = Self {
            generation,
            connection_id,
            peer_connection,
            senders: Mutex::new(Vec::new()),
        };
        peer.register_handlers(events);

        Ok(peer)
    }

    fn register_handlers(&self, events: PeerEventSender) {
        let generation = self.generation;

        let tx = events.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!("ICE gathering complete (generation {})", generation);
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send((generation, PeerEvent::IceCandidate(from_init(init))));
                        }
                        Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                    }
                })
            }));

        let tx = events.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    let state = ConnectionState::from(s);
                    debug!("Peer connection state (generation {}): {}", generation, state);
                    let _ = tx.send((generation, PeerEvent::ConnectionState(state)));
                })
            }));

        let tx = events.clone();
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    let state = IceConnectionState::from(s);
                    debug!("ICE connection state (generation {}): {}", generation, state);
                    let _ = tx.send((generation, PeerEvent::IceConnectionState(state)));
                })
            }));

        let tx = events.clone();
        self.peer_connection.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((generation, PeerEvent::NegotiationNeeded));
            })
        }));

        let tx = events;
        self.peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let tx = tx.clone();
                Box::pin(async move {
                    info!("Remote data channel '{}' announced", channel.label());
                    let _ = tx.send((generation, PeerEvent::DataChannel(channel)));
                })
            }));
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.peer_connection.connection_state().into()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.peer_connection.ice_connection_state().into()
    }

    /// Attach every live local track; returns how many were added
    pub async fn attach_media(&self, media: &LocalMedia) -> Result<usize> {
        let mut added = Vec::new();

        for local in media.tracks() {
            let sender = self
                .peer_connection
                .add_track(local.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| {
                    Error::PeerConnectionError(format!("Failed to add {} track: {}", local.kind, e))
                })?;
            debug!("Attached local {} track", local.kind);
            added.push(sender);
        }

        let count = added.len();
        if let Ok(mut senders) = self.senders.lock() {
            senders.extend(added);
        }
        Ok(count)
    }

    /// Create the application data channel (Host side)
    pub async fn create_data_channel(&self, config: &DataChannelConfig) -> Result<Arc<RTCDataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(config.ordered),
            max_retransmits: Some(config.max_retransmits),
            ..Default::default()
        };

        let channel = self
            .peer_connection
            .create_data_channel(&config.label, Some(init))
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to create data channel: {}", e)))?;

        info!(
            "Created data channel '{}' (ordered={}, max_retransmits={})",
            config.label, config.ordered, config.max_retransmits
        );
        Ok(channel)
    }

    /// Close the connection
    pub async fn close(&self) -> Result<()> {
        info!("Closing peer connection (generation {})", self.generation);

        if let Ok(mut senders) = self.senders.lock() {
            senders.clear();
        }

        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close connection: {}", e)))
    }
}

#[async_trait]
impl PeerHandle for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback(&self) -> Result<()> {
        // webrtc-rs parses the description even for a rollback, so it
        // carries the SDP being undone
        if let Some(local) = self.peer_connection.pending_local_description().await {
            return self
                .peer_connection
                .set_local_description(rollback_of(local))
                .await
                .map_err(|e| Error::SdpError(format!("Failed to roll back local offer: {}", e)));
        }

        if let Some(remote) = self.peer_connection.pending_remote_description().await {
            return self
                .peer_connection
                .set_remote_description(rollback_of(remote))
                .await
                .map_err(|e| Error::SdpError(format!("Failed to roll back remote offer: {}", e)));
        }

        debug!("Nothing to roll back");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(to_init(candidate))
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }
}

#[async_trait]
impl StatsSource for RtcPeer {
    async fn collect_stats(&self) -> Result<ConnectionStats> {
        let report = self.peer_connection.get_stats().await;
        Ok(summarize_stats(report.reports.values()))
    }
}

/// Fold a webrtc-rs stats report into one snapshot
///
/// Byte counters come from the ICE transport: webrtc-rs leaves the
/// candidate pair counters at zero. Round-trip time is taken from the
/// nominated pair, or from RTCP receiver reports when the pair has none.
fn summarize_stats<'a>(reports: impl IntoIterator<Item = &'a StatsReportType>) -> ConnectionStats {
    let mut stats = ConnectionStats {
        captured_at: Instant::now(),
        ..Default::default()
    };
    let mut pair_rtt = None;
    let mut rtcp_rtt = None;

    for report in reports {
        match report {
            StatsReportType::Transport(transport) => {
                stats.bytes_sent += transport.bytes_sent as u64;
                stats.bytes_received += transport.bytes_received as u64;
            }
            StatsReportType::CandidatePair(pair)
                if pair.nominated && pair.current_round_trip_time > 0.0 =>
            {
                pair_rtt = Some(pair.current_round_trip_time);
            }
            StatsReportType::RemoteInboundRTP(remote) => {
                stats.packets_lost += remote.packets_lost.max(0) as u64;
                if let Some(rtt) = remote.round_trip_time.filter(|rtt| *rtt > 0.0) {
                    rtcp_rtt = Some(rtt);
                }
            }
            _ => {}
        }
    }

    stats.round_trip_time = pair_rtt.or(rtcp_rtt).map(Duration::from_secs_f64);
    stats
}

fn ice_servers(config: &SessionConfig) -> Vec<RTCIceServer> {
    config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        }))
        .collect()
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(|e| Error::SdpError(format!("Failed to parse {:?}: {}", description.kind, e)))
}

fn rollback_of(pending: RTCSessionDescription) -> RTCSessionDescription {
    let mut rollback = RTCSessionDescription::default();
    rollback.sdp_type = RTCSdpType::Rollback;
    rollback.sdp = pending.sdp;
    rollback
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Role, TurnServerConfig};

    fn config() -> SessionConfig {
        SessionConfig {
            stun_servers: vec![],
            ..SessionConfig::new("ws://localhost:8080", "room-1", "alice", Role::Host)
        }
    }

    #[test]
    fn test_ice_servers_from_config() {
        let mut config = SessionConfig::new("ws://localhost:8080", "room-1", "alice", Role::Host);
        config.turn_servers.push(TurnServerConfig {
            url: "turn:turn.example.com:3478".to_string(),
            username: "user".to_string(),
            credential: "secret".to_string(),
        });

        let servers = ice_servers(&config);
        assert_eq!(servers.len(), config.stun_servers.len() + 1);
        let turn = servers.last().unwrap();
        assert_eq!(turn.username, "user");
        assert_eq!(turn.credential, "secret");
    }

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };
        assert_eq!(from_init(to_init(candidate.clone())), candidate);
    }

    #[tokio::test]
    async fn test_offer_contains_data_channel() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = RtcPeer::new(&config(), 1, tx).await.unwrap();
        peer.create_data_channel(&DataChannelConfig::default())
            .await
            .unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=application"));

        peer.close().await.unwrap();
    }

    fn transport(id: &str, sent: usize, received: usize) -> StatsReportType {
        StatsReportType::Transport(webrtc::stats::ICETransportStats {
            timestamp: tokio::time::Instant::now(),
            stats_type: webrtc::stats::RTCStatsType::Transport,
            id: id.to_string(),
            bytes_received: received,
            bytes_sent: sent,
        })
    }

    #[test]
    fn test_bytes_come_from_ice_transport() {
        let reports = vec![
            transport("ice_transport", 1200, 800),
            // Same ICE agent reported again under the SCTP transport
            StatsReportType::SCTPTransport(webrtc::stats::ICETransportStats {
                timestamp: tokio::time::Instant::now(),
                stats_type: webrtc::stats::RTCStatsType::Transport,
                id: "sctp_transport".to_string(),
                bytes_received: 800,
                bytes_sent: 1200,
            }),
        ];

        let stats = summarize_stats(&reports);
        assert_eq!(stats.bytes_sent, 1200);
        assert_eq!(stats.bytes_received, 800);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(stats.round_trip_time, None);
    }

    #[tokio::test]
    async fn test_stats_before_connect_are_zero() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = RtcPeer::new(&config(), 1, tx).await.unwrap();

        let stats = peer.collect_stats().await.unwrap();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.packets_lost, 0);
        peer.close().await.unwrap();
    }
}
