//! Reconnecting WebSocket client for the room relay

use super::protocol::SignalingMessage;
use super::SignalingSink;
use crate::config::SessionConfig;
use crate::reconnect::ReconnectPolicy;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Close reason sent with the intentional-close frame
pub const INTENTIONAL_CLOSE_REASON: &str = "user left";

/// Relay connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// First connection attempt in progress
    Connecting,
    /// Socket open, messages flow directly
    Open,
    /// Connection lost, waiting for or performing a retry
    Reconnecting,
    /// Closed intentionally; no further attempts
    Closed,
}

/// How a single socket connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionOutcome {
    Intentional,
    Lost,
}

/// Outbound path: a live writer or the pending buffer
#[derive(Default)]
struct Outbound {
    writer: Option<mpsc::UnboundedSender<SignalingMessage>>,
    pending: VecDeque<SignalingMessage>,
}

struct Shared {
    endpoint: String,
    user_name: String,
    policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    outbound: Mutex<Outbound>,
    inbound_tx: mpsc::UnboundedSender<SignalingMessage>,
    state_tx: watch::Sender<TransportState>,
    shutdown_tx: watch::Sender<bool>,
    closing: AtomicBool,
}

impl Shared {
    fn outbound(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TransportState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Relay transport {:?} -> {:?}", *current, state);
            *current = state;
            true
        });
    }

    /// Install a writer for a freshly opened socket
    ///
    /// The join announcement goes first, then the buffer in FIFO order. The
    /// lock is held throughout so concurrent `send` calls queue behind the
    /// flushed messages.
    fn attach_writer(&self, tx: &mpsc::UnboundedSender<SignalingMessage>) {
        let mut outbound = self.outbound();
        let _ = tx.send(SignalingMessage::Join {
            user_name: self.user_name.clone(),
        });

        let flushed = outbound.pending.len();
        while let Some(msg) = outbound.pending.pop_front() {
            let _ = tx.send(msg);
        }
        outbound.writer = Some(tx.clone());

        if flushed > 0 {
            info!("Flushed {} buffered signaling messages", flushed);
        }
    }

    /// Detach the writer of a dead socket, returning unsent messages to the
    /// front of the buffer in their original order
    fn detach_writer(
        &self,
        failed: Option<SignalingMessage>,
        rx: &mut mpsc::UnboundedReceiver<SignalingMessage>,
    ) {
        let mut outbound = self.outbound();
        outbound.writer = None;

        let mut unsent: Vec<SignalingMessage> = failed.into_iter().collect();
        while let Ok(msg) = rx.try_recv() {
            unsent.push(msg);
        }

        let requeued: Vec<SignalingMessage> = unsent
            .into_iter()
            .filter(|msg| !msg.is_heartbeat() && !matches!(msg, SignalingMessage::Join { .. }))
            .collect();

        if !requeued.is_empty() {
            debug!("Requeued {} unsent signaling messages", requeued.len());
        }
        for msg in requeued.into_iter().rev() {
            outbound.pending.push_front(msg);
        }
    }

    fn deliver(&self, msg: SignalingMessage) {
        if self.inbound_tx.send(msg).is_err() {
            debug!("Inbound signaling receiver dropped");
        }
    }
}

/// WebSocket client for the room relay
///
/// Connects to `<signaling_url>/join-room?roomID=<room>`, announces the
/// local user on every open, buffers outbound messages while the socket is
/// down and retries with a bounded randomized delay until closed.
pub struct SignalingClient {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Create a client for `endpoint` without connecting
    ///
    /// Returns the client and the stream of inbound messages (heartbeats
    /// excluded).
    pub fn new(
        endpoint: String,
        user_name: String,
        policy: ReconnectPolicy,
        heartbeat_interval: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(TransportState::Connecting);
        let (shutdown_tx, _) = watch::channel(false);

        let client = Arc::new(Self {
            shared: Arc::new(Shared {
                endpoint,
                user_name,
                policy,
                heartbeat_interval,
                outbound: Mutex::new(Outbound::default()),
                inbound_tx,
                state_tx,
                shutdown_tx,
                closing: AtomicBool::new(false),
            }),
            supervisor: Mutex::new(None),
        });

        (client, inbound_rx)
    }

    /// Create a client from session configuration
    pub fn from_config(
        config: &SessionConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SignalingMessage>)> {
        let endpoint = join_room_url(&config.signaling_url, &config.room_id)?;
        Ok(Self::new(
            endpoint,
            config.display_name.clone(),
            ReconnectPolicy::from(&config.timing),
            config.timing.heartbeat_interval(),
        ))
    }

    /// Start connecting in the background
    ///
    /// Connection failures are retried indefinitely and only show up in
    /// [`state`](Self::state); this call never fails because of the network.
    pub fn connect(&self) -> Result<()> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }

        let mut supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if supervisor.is_some() {
            debug!("Relay client already started");
            return Ok(());
        }

        info!("Connecting to relay: {}", self.shared.endpoint);
        *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.shared))));
        Ok(())
    }

    /// Close intentionally
    ///
    /// Messages already handed to the socket are written, then a close frame
    /// with code 1000 is sent. Reconnection is suppressed and every owned
    /// task ends.
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Closing relay connection");
        let _ = self.shared.shutdown_tx.send_replace(true);

        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                warn!("Relay supervisor did not stop in time, aborting");
                abort.abort();
            }
        }

        self.shared.outbound().pending.clear();
        self.shared.set_state(TransportState::Closed);
    }

    /// Current transport state
    pub fn state(&self) -> TransportState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to transport state changes
    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.shared.state_tx.subscribe()
    }

    /// True while a lost connection is being re-established
    pub fn is_reconnecting(&self) -> bool {
        self.state() == TransportState::Reconnecting
    }

    /// Number of messages waiting for the next open socket
    pub fn pending_len(&self) -> usize {
        self.shared.outbound().pending.len()
    }

    /// Full relay endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }
}

impl SignalingSink for SignalingClient {
    fn send(&self, message: SignalingMessage) {
        if message.is_heartbeat() {
            trace!("Heartbeats are driven by the transport itself");
            return;
        }

        if self.shared.closing.load(Ordering::SeqCst) {
            debug!("Dropping {} sent after close", message.kind());
            return;
        }

        let mut outbound = self.shared.outbound();
        if let Some(writer) = outbound.writer.as_ref() {
            match writer.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => {
                    outbound.writer = None;
                    outbound.pending.push_back(message);
                    return;
                }
            }
        }

        debug!("Relay not open, buffering {}", message.kind());
        outbound.pending.push_back(message);
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        let _ = self.shared.shutdown_tx.send_replace(true);
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Build the relay endpoint for a room
pub fn join_room_url(signaling_url: &str, room_id: &str) -> Result<String> {
    let mut url = url::Url::parse(signaling_url)
        .map_err(|e| Error::InvalidConfig(format!("Invalid signaling URL: {}", e)))?;

    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(Error::InvalidConfig(format!(
            "signaling_url must use ws or wss, got {}",
            url.scheme()
        )));
    }

    let path = format!("{}/join-room", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().clear().append_pair("roomID", room_id);

    Ok(url.to_string())
}

/// Connect, serve, and retry until closed
async fn supervise(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let attempt = tokio::select! {
            result = connect_async(shared.endpoint.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        match attempt {
            Ok((ws, _response)) => {
                info!("Connected to relay");
                failures = 0;
                if run_connection(&shared, ws, &mut shutdown).await
                    == ConnectionOutcome::Intentional
                {
                    break;
                }
                warn!("Relay connection lost");
            }
            Err(e) => {
                warn!("Relay connect failed: {}", e);
            }
        }

        if shared.closing.load(Ordering::SeqCst) {
            break;
        }

        failures = failures.saturating_add(1);
        shared.set_state(TransportState::Reconnecting);

        let delay = shared.policy.delay(failures);
        info!(
            "Reconnecting to relay in {:?} (consecutive failures: {})",
            delay, failures
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    shared.set_state(TransportState::Closed);
    debug!("Relay supervisor terminated");
}

/// Serve one open socket until it closes
async fn run_connection(
    shared: &Arc<Shared>,
    ws: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionOutcome {
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();

    shared.attach_writer(&tx);
    drop(tx);
    shared.set_state(TransportState::Open);

    let period = shared.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                // Write what was handed over before the close request
                while let Ok(msg) = rx.try_recv() {
                    if let Ok(json) = msg.to_json() {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: Cow::Borrowed(INTENTIONAL_CLOSE_REASON),
                };
                if let Err(e) = write.send(Message::Close(Some(frame))).await {
                    debug!("Close frame not delivered: {}", e);
                }
                shared.outbound().writer = None;
                return ConnectionOutcome::Intentional;
            }

            Some(msg) = rx.recv() => {
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Dropping unserializable {}: {}", msg.kind(), e);
                        continue;
                    }
                };
                trace!("Sending {}", msg.kind());
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("Relay write failed: {}", e);
                    shared.detach_writer(Some(msg), &mut rx);
                    return ConnectionOutcome::Lost;
                }
            }

            _ = heartbeat.tick() => {
                if let Ok(json) = SignalingMessage::Ping.to_json() {
                    if let Err(e) = write.send(Message::Text(json)).await {
                        warn!("Heartbeat write failed: {}", e);
                        shared.detach_writer(None, &mut rx);
                        return ConnectionOutcome::Lost;
                    }
                }
            }

            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!("Relay closed the connection: {:?}", frame);
                        shared.detach_writer(None, &mut rx);
                        return ConnectionOutcome::Lost;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Relay read error: {}", e);
                        shared.detach_writer(None, &mut rx);
                        return ConnectionOutcome::Lost;
                    }
                    None => {
                        shared.detach_writer(None, &mut rx);
                        return ConnectionOutcome::Lost;
                    }
                };

                match SignalingMessage::from_json(&text) {
                    Ok(SignalingMessage::Ping) => {
                        if let Ok(json) = SignalingMessage::Pong.to_json() {
                            if write.send(Message::Text(json)).await.is_err() {
                                shared.detach_writer(None, &mut rx);
                                return ConnectionOutcome::Lost;
                            }
                        }
                    }
                    Ok(SignalingMessage::Pong) => trace!("Heartbeat acknowledged"),
                    Ok(msg) => {
                        debug!("Received {}", msg.kind());
                        shared.deliver(msg);
                    }
                    Err(e) => warn!("Failed to handle signaling message: {}", e),
                }
            }
        }
    }
}
