//! Room call session
//!
//! Owns the relay client, the current peer connection and everything bound
//! to it. A single dispatch task consumes relay messages and peer events in
//! arrival order; rebuilds run on the reconnection controller's task.
//!
//! Offers, answers and candidates that arrive while no connection exists
//! (between teardown and rebuild) are held by the dispatch task and handled,
//! in order, once the next connection is installed.

use super::SessionSnapshot;
use crate::channels::{DataChannelBridge, Subscription};
use crate::config::{Role, SessionConfig};
use crate::health::{ConnectionHealthMonitor, ConnectionStats, HealthAction};
use crate::media::{CaptureDevice, LocalMedia};
use crate::negotiation::{Negotiator, Politeness};
use crate::peer::{ConnectionState, IceConnectionState, PeerEvent, PeerEventSender, RtcPeer};
use crate::reconnect::{PeerLifecycle, ReconnectionController};
use crate::signaling::{SignalingClient, SignalingMessage, SignalingSink};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Relay messages held while no peer connection exists
const MAX_HELD_SIGNALING: usize = 256;

#[derive(Clone)]
struct ActivePeer {
    peer: Arc<RtcPeer>,
    negotiator: Arc<Negotiator<RtcPeer>>,
}

struct SessionInner {
    config: SessionConfig,
    signaling: Arc<SignalingClient>,
    device: Arc<dyn CaptureDevice>,
    media: Mutex<Option<LocalMedia>>,
    bridge: Arc<DataChannelBridge>,
    health: ConnectionHealthMonitor,
    controller: ReconnectionController,
    active: Mutex<Option<ActivePeer>>,
    generation: AtomicU64,
    events_tx: PeerEventSender,
    remote_present: AtomicBool,
    closed: AtomicBool,
    connection_state_tx: watch::Sender<ConnectionState>,
    ice_state_tx: watch::Sender<IceConnectionState>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    /// Generation of the last connection that finished building
    peer_ready_tx: watch::Sender<u64>,
}

async fn acquire_media(device: &dyn CaptureDevice, config: &SessionConfig) -> Result<LocalMedia> {
    device
        .acquire(config.audio_enabled, config.video_enabled)
        .await
        .map_err(|e| match e {
            Error::MediaCapture(_) => e,
            other => Error::MediaCapture(other.to_string()),
        })
}

impl SessionInner {
    /// Create a fresh peer connection and make it the active one
    async fn build_peer(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let peer = Arc::new(RtcPeer::new(&self.config, generation, self.events_tx.clone()).await?);
        let sink: Arc<dyn SignalingSink> = self.signaling.clone();
        let negotiator = Arc::new(Negotiator::new(
            peer.clone(),
            sink,
            Politeness::from(self.config.role),
        ));

        let previous = self.active.lock().await.replace(ActivePeer {
            peer: peer.clone(),
            negotiator: negotiator.clone(),
        });
        if let Some(previous) = previous {
            warn!(
                "Replacing live peer connection (generation {})",
                previous.peer.generation()
            );
            if let Err(e) = previous.peer.close().await {
                debug!("Closing replaced peer connection: {}", e);
            }
        }

        self.connection_state_tx.send_replace(ConnectionState::New);
        self.ice_state_tx.send_replace(IceConnectionState::New);

        {
            let mut media = self.media.lock().await;
            if media.is_none() {
                *media = Some(acquire_media(self.device.as_ref(), &self.config).await?);
            }
            if let Some(media) = media.as_ref() {
                if peer.attach_media(media).await? > 0 {
                    negotiator.mark_tracks_added().await;
                }
            }
        }

        if self.config.role.creates_data_channel() {
            let channel = peer.create_data_channel(&self.config.data_channel).await?;
            self.bridge.attach_rtc(channel);
        }

        info!(generation, "Peer connection ready");
        self.peer_ready_tx.send_replace(generation);
        self.publish_snapshot();
        Ok(())
    }

    /// Close the active connection and release what is bound to it
    async fn teardown_peer(&self) {
        self.health.stop();
        self.bridge.detach().await;

        let previous = self.active.lock().await.take();
        if let Some(active) = previous {
            active.negotiator.reset().await;
            if let Err(e) = active.peer.close().await {
                debug!("Closing peer connection: {}", e);
            }
        }

        if let Some(media) = self.media.lock().await.take() {
            media.stop();
        }
        self.publish_snapshot();
    }

    /// Replace the connection immediately, without the rebuild delay
    async fn reset_peer(&self) {
        self.teardown_peer().await;
        match self.build_peer().await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                warn!("Failed to rebuild peer connection, retrying: {}", e);
                self.controller.trigger("rebuild failed");
            }
            Err(e) => error!("Failed to rebuild peer connection: {}", e),
        }
    }

    async fn current(&self) -> Option<ActivePeer> {
        self.active.lock().await.clone()
    }

    async fn current_for(&self, generation: u64) -> Option<ActivePeer> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|active| active.peer.generation() == generation)
            .cloned()
    }

    async fn negotiate(&self, active: &ActivePeer) {
        if let Err(e) = active.negotiator.negotiate().await {
            warn!("Negotiation failed: {}", e);
        }
    }

    /// Handle one relay message
    ///
    /// Returns the message back when it needs a peer connection and none
    /// exists yet; the caller holds it until the next one is built.
    async fn handle_signaling(&self, message: SignalingMessage) -> Option<SignalingMessage> {
        match message {
            SignalingMessage::Join { user_name } => {
                info!(user_name = %user_name, "Remote participant joined");
                self.remote_present.store(true, Ordering::SeqCst);

                let active = self.current().await?;
                // A re-announcement after a relay reconnect must not disturb
                // an established call
                if active.peer.connection_state() != ConnectionState::New {
                    debug!("Join while connection is {}", active.peer.connection_state());
                } else if !active.negotiator.resend_offer().await {
                    self.negotiate(&active).await;
                }
                None
            }
            SignalingMessage::Leave => {
                info!("Remote participant left");
                self.remote_present.store(false, Ordering::SeqCst);
                self.controller.cancel();
                self.reset_peer().await;
                None
            }
            SignalingMessage::Ping | SignalingMessage::Pong => None,
            message => {
                if matches!(message, SignalingMessage::Offer(_)) {
                    self.remote_present.store(true, Ordering::SeqCst);
                }
                let Some(active) = self.current().await else {
                    if self.closed.load(Ordering::SeqCst) {
                        return None;
                    }
                    return Some(message);
                };
                self.handle_exchange(&active, message).await;
                None
            }
        }
    }

    async fn handle_exchange(&self, active: &ActivePeer, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer(offer) => {
                if let Err(e) = active.negotiator.handle_offer(offer).await {
                    warn!("Failed to handle offer: {}", e);
                }
            }
            SignalingMessage::Answer(answer) => {
                if let Err(e) = active.negotiator.handle_answer(answer).await {
                    warn!("Failed to handle answer: {}", e);
                }
            }
            SignalingMessage::IceCandidate(candidate) => {
                active.negotiator.handle_candidate(candidate).await;
            }
            other => debug!("Ignoring {:?}", other),
        }
    }

    /// Handle held relay messages in arrival order
    ///
    /// Stops at the first message that still has no connection to go to.
    async fn drain_signaling(&self, held: &mut VecDeque<SignalingMessage>) {
        while let Some(message) = held.pop_front() {
            if let Some(message) = self.handle_signaling(message).await {
                held.push_front(message);
                if held.len() > MAX_HELD_SIGNALING {
                    warn!("Too many held relay messages, dropping the oldest");
                    held.pop_front();
                }
                debug!("No peer connection, holding {} relay messages", held.len());
                return;
            }
        }
    }

    async fn handle_peer_event(&self, generation: u64, event: PeerEvent) {
        let Some(active) = self.current_for(generation).await else {
            debug!("Ignoring {:?} from stale connection {}", event, generation);
            return;
        };

        match event {
            PeerEvent::IceCandidate(candidate) => {
                self.signaling.send(SignalingMessage::IceCandidate(candidate));
            }
            PeerEvent::ConnectionState(state) => {
                self.connection_state_tx.send_replace(state);
                let action = self.health.observe_connection(state);
                self.apply_health(action, &active, &format!("connection {}", state));
            }
            PeerEvent::IceConnectionState(state) => {
                self.ice_state_tx.send_replace(state);
                let action = self.health.observe_ice(state);
                self.apply_health(action, &active, &format!("ice {}", state));
            }
            PeerEvent::NegotiationNeeded => {
                if self.remote_present.load(Ordering::SeqCst) {
                    self.negotiate(&active).await;
                } else {
                    debug!("Negotiation needed, waiting for a remote participant");
                }
            }
            PeerEvent::DataChannel(channel) => {
                if self.config.role.creates_data_channel() {
                    warn!("Ignoring data channel '{}' opened by the remote side", channel.label());
                } else {
                    self.bridge.attach_rtc(channel);
                }
            }
        }
    }

    fn apply_health(&self, action: HealthAction, active: &ActivePeer, reason: &str) {
        match action {
            HealthAction::StartPolling => {
                self.health.start_polling(active.peer.clone());
                self.controller.mark_connected();
            }
            HealthAction::Recover => {
                self.health.stop();
                if !self.closed.load(Ordering::SeqCst) {
                    self.controller.trigger(reason);
                }
            }
            HealthAction::None => {}
        }
    }

    fn is_reconnecting(&self) -> bool {
        self.signaling.is_reconnecting() || self.controller.is_reconnecting()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            room_id: self.config.room_id.clone(),
            display_name: self.config.display_name.clone(),
            role: self.config.role,
            connection_state: *self.connection_state_tx.borrow(),
            ice_connection_state: *self.ice_state_tx.borrow(),
            data_channel_open: self.bridge.is_open(),
            is_reconnecting: self.is_reconnecting(),
        }
    }

    fn publish_snapshot(&self) {
        let next = self.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[async_trait]
impl PeerLifecycle for SessionInner {
    async fn teardown(&self) {
        self.teardown_peer().await;
    }

    async fn rebuild(&self) -> Result<()> {
        self.build_peer().await
    }

    async fn renegotiate(&self) -> Result<()> {
        match self.current().await {
            Some(active) => active.negotiator.negotiate().await.map(|_| ()),
            None => Ok(()),
        }
    }
}

async fn run_dispatch(
    inner: Arc<SessionInner>,
    mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    mut events: mpsc::UnboundedReceiver<(u64, PeerEvent)>,
) {
    let mut transport = inner.signaling.watch_state();
    let mut reconnecting = inner.controller.watch_reconnecting();
    let mut channel_open = inner.bridge.watch_open();
    let mut peer_ready = inner.peer_ready_tx.subscribe();
    let mut held = VecDeque::new();

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => {
                    held.push_back(message);
                    inner.drain_signaling(&mut held).await;
                }
                None => {
                    debug!("Relay inbound stream ended");
                    break;
                }
            },

            Some((generation, event)) = events.recv() => {
                // Messages held for this connection predate its own events
                inner.drain_signaling(&mut held).await;
                inner.handle_peer_event(generation, event).await;
            }

            Ok(()) = peer_ready.changed() => {
                peer_ready.borrow_and_update();
                inner.drain_signaling(&mut held).await;
            }

            Ok(()) = transport.changed() => {
                let state = *transport.borrow_and_update();
                debug!("Relay transport {:?}", state);
            }

            Ok(()) = reconnecting.changed() => {
                reconnecting.borrow_and_update();
            }

            Ok(()) = channel_open.changed() => {
                channel_open.borrow_and_update();
            }
        }

        inner.publish_snapshot();
    }
}

/// Two-party call in one room
///
/// Created by [`RoomSession::start`], ended by [`RoomSession::leave`] or
/// by dropping it.
pub struct RoomSession {
    inner: Arc<SessionInner>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RoomSession {
    /// Join a room
    ///
    /// Fails if the configuration is invalid, local media cannot be
    /// acquired or the first peer connection cannot be created. Relay
    /// connectivity problems are not errors: they are retried in the
    /// background and reported through [`is_reconnecting`](Self::is_reconnecting).
    #[instrument(skip(config, device), fields(room_id = %config.room_id, role = %config.role))]
    pub async fn start(config: SessionConfig, device: Arc<dyn CaptureDevice>) -> Result<Self> {
        config.validate()?;

        let media = acquire_media(device.as_ref(), &config).await?;
        let (signaling, inbound) = SignalingClient::from_config(&config)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let role = config.role;
        let rebuild_delay = config.timing.rebuild_delay();
        let stats_interval = config.timing.stats_interval();
        let initial = SessionSnapshot::initial(&config);

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let lifecycle: Weak<dyn PeerLifecycle> = weak.clone();
            let (connection_state_tx, _) = watch::channel(ConnectionState::New);
            let (ice_state_tx, _) = watch::channel(IceConnectionState::New);
            let (snapshot_tx, _) = watch::channel(initial);
            let (peer_ready_tx, _) = watch::channel(0);

            SessionInner {
                config,
                signaling,
                device,
                media: Mutex::new(Some(media)),
                bridge: Arc::new(DataChannelBridge::new()),
                health: ConnectionHealthMonitor::new(stats_interval),
                controller: ReconnectionController::new(lifecycle, role, rebuild_delay),
                active: Mutex::new(None),
                generation: AtomicU64::new(0),
                events_tx,
                // A guest joins a room its host already occupies
                remote_present: AtomicBool::new(role.is_polite()),
                closed: AtomicBool::new(false),
                connection_state_tx,
                ice_state_tx,
                snapshot_tx,
                peer_ready_tx,
            }
        });

        if let Err(e) = inner.build_peer().await {
            error!("Failed to create peer connection: {}", e);
            inner.closed.store(true, Ordering::SeqCst);
            inner.teardown_peer().await;
            return Err(e);
        }

        if let Err(e) = inner.signaling.connect() {
            inner.closed.store(true, Ordering::SeqCst);
            inner.teardown_peer().await;
            return Err(e);
        }

        let dispatcher = tokio::spawn(run_dispatch(inner.clone(), inbound, events_rx));
        info!("Session started");

        Ok(Self {
            inner,
            dispatcher: std::sync::Mutex::new(Some(dispatcher)),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.inner.config.room_id
    }

    pub fn role(&self) -> Role {
        self.inner.config.role
    }

    /// Send chat text; returns whether it was handed to an open channel
    pub async fn send_message(&self, text: impl Into<String>) -> bool {
        self.inner.bridge.send(text).await
    }

    /// Register a callback for inbound chat text
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.inner.bridge.subscribe(callback)
    }

    /// Rebuild the peer connection; ignored while a rebuild is running
    pub fn reconnect(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.controller.reconnect()
    }

    pub fn data_channel_open(&self) -> bool {
        self.inner.bridge.is_open()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_state_tx.borrow()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        *self.inner.ice_state_tx.borrow()
    }

    /// Relay reconnecting, or a peer rebuild not yet connected
    pub fn is_reconnecting(&self) -> bool {
        self.inner.is_reconnecting()
    }

    /// Latest statistics snapshot, if any was taken
    pub fn connection_stats(&self) -> Option<ConnectionStats> {
        self.inner.health.latest()
    }

    pub fn watch_stats(&self) -> watch::Receiver<Option<ConnectionStats>> {
        self.inner.health.watch()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Identifier of the active peer connection
    pub async fn connection_id(&self) -> Option<String> {
        self.inner
            .current()
            .await
            .map(|active| active.peer.connection_id().to_string())
    }

    /// Leave the room
    ///
    /// Announces the departure, closes the relay intentionally (no
    /// reconnection), cancels pending rebuilds and releases the connection
    /// and local media. Calling it again is a no-op.
    pub async fn leave(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Leaving room {}", self.inner.config.room_id);
        self.inner.signaling.send(SignalingMessage::Leave);
        self.inner.controller.cancel();
        self.inner.teardown_peer().await;
        self.inner.signaling.close().await;

        let dispatcher = self
            .dispatcher
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }

        self.inner.connection_state_tx.send_replace(ConnectionState::Closed);
        self.inner.publish_snapshot();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.controller.cancel();
        self.inner.health.stop();

        if let Ok(mut slot) = self.dispatcher.lock() {
            if let Some(dispatcher) = slot.take() {
                dispatcher.abort();
            }
        }

        if let Ok(mut media) = self.inner.media.try_lock() {
            if let Some(media) = media.take() {
                media.stop();
            }
        }

        // Peer connection and relay close need the runtime
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move {
                inner.teardown_peer().await;
                inner.signaling.close().await;
            });
        }
    }
}
