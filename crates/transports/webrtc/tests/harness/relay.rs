//! In-process room relay for integration testing
//!
//! Accepts WebSocket connections on `/join-room?roomID=<room>`, forwards
//! every text frame verbatim to the other members of the same room and
//! answers heartbeats. Connections can be cut without a close frame to
//! simulate network loss.

use super::{HarnessError, HarnessResult};
use futures::{SinkExt, StreamExt};
use roomcall_webrtc::SignalingMessage;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

/// Frame recorded by the relay
#[derive(Debug, Clone)]
pub struct Recorded {
    pub room_id: String,
    pub member: u64,
    pub message: SignalingMessage,
}

struct Member {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<String, Vec<Member>>,
    received: Vec<Recorded>,
    close_codes: Vec<u16>,
    pings: usize,
    accepted: usize,
}

struct Shared {
    state: Mutex<RelayState>,
    accepting: AtomicBool,
    next_member: AtomicU64,
    cut_tx: watch::Sender<u64>,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Embedded relay on a random local port
pub struct TestRelay {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_handle: JoinHandle<()>,
}

impl TestRelay {
    /// Bind to a random available port and start accepting
    pub async fn start() -> HarnessResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| HarnessError::RelayError(format!("Failed to bind: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| HarnessError::RelayError(format!("Failed to get local addr: {}", e)))?;

        let (cut_tx, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            state: Mutex::new(RelayState::default()),
            accepting: AtomicBool::new(true),
            next_member: AtomicU64::new(1),
            cut_tx,
        });

        let accept_shared = Arc::clone(&shared);
        let accept_handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("Relay accept failed: {}", e);
                        continue;
                    }
                };

                if !accept_shared.accepting.load(Ordering::SeqCst) {
                    debug!("Relay refusing {}", peer);
                    drop(stream);
                    continue;
                }

                tokio::spawn(serve(Arc::clone(&accept_shared), stream));
            }
        });

        info!("Test relay listening on {}", addr);
        Ok(Self {
            addr,
            shared,
            accept_handle,
        })
    }

    /// Base URL to put into `SessionConfig::signaling_url`
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Refuse (or resume accepting) new connections
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Drop every open socket without a close frame
    pub fn cut_connections(&self) {
        self.shared.cut_tx.send_modify(|epoch| *epoch += 1);
    }

    /// Send a raw JSON frame to every member of a room
    pub fn inject(&self, room_id: &str, json: &str) -> usize {
        let state = self.shared.state();
        state
            .rooms
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.tx.send(Message::Text(json.to_string())).is_ok())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Non-heartbeat messages received from clients, in arrival order
    pub fn received(&self, room_id: &str) -> Vec<Recorded> {
        self.shared
            .state()
            .received
            .iter()
            .filter(|r| r.room_id == room_id)
            .cloned()
            .collect()
    }

    pub fn members(&self, room_id: &str) -> usize {
        self.shared
            .state()
            .rooms
            .get(room_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Close codes of client-initiated close frames
    pub fn close_codes(&self) -> Vec<u16> {
        self.shared.state().close_codes.clone()
    }

    pub fn pings(&self) -> usize {
        self.shared.state().pings
    }

    /// Completed WebSocket handshakes
    pub fn accepted(&self) -> usize {
        self.shared.state().accepted
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.accept_handle.abort();
        self.cut_connections();
    }
}

fn room_of(uri: &str) -> Option<String> {
    let url = url::Url::parse(&format!("ws://relay{}", uri)).ok()?;
    if url.path() != "/join-room" {
        return None;
    }
    url.query_pairs()
        .find(|(key, _)| key == "roomID")
        .map(|(_, value)| value.into_owned())
}

async fn serve(shared: Arc<Shared>, stream: TcpStream) {
    let mut uri = String::new();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        uri = request.uri().to_string();
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Relay handshake failed: {}", e);
            return;
        }
    };

    let Some(room_id) = room_of(&uri) else {
        debug!("Relay rejecting {}", uri);
        return;
    };

    let id = shared.next_member.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    {
        let mut state = shared.state();
        state.accepted += 1;
        state
            .rooms
            .entry(room_id.clone())
            .or_default()
            .push(Member { id, tx: tx.clone() });
    }
    debug!(member = id, room_id = %room_id, "Relay member joined");

    let mut cut = shared.cut_tx.subscribe();
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = cut.changed() => {
                debug!(member = id, "Relay cutting connection");
                break;
            }

            Some(outgoing) = rx.recv() => {
                if write.send(outgoing).await.is_err() {
                    break;
                }
            }

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match SignalingMessage::from_json(&text) {
                        Ok(SignalingMessage::Ping) => {
                            shared.state().pings += 1;
                            let _ = tx.send(Message::Text(r#"{"type":"pong"}"#.to_string()));
                        }
                        Ok(SignalingMessage::Pong) => {}
                        Ok(message) => {
                            let mut state = shared.state();
                            state.received.push(Recorded {
                                room_id: room_id.clone(),
                                member: id,
                                message,
                            });
                            if let Some(members) = state.rooms.get(&room_id) {
                                for member in members.iter().filter(|m| m.id != id) {
                                    let _ = member.tx.send(Message::Text(text.clone()));
                                }
                            }
                        }
                        Err(e) => debug!("Relay ignoring frame: {}", e),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        shared.state().close_codes.push(u16::from(frame.code));
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            }
        }
    }

    let mut state = shared.state();
    if let Some(members) = state.rooms.get_mut(&room_id) {
        members.retain(|m| m.id != id);
    }
    debug!(member = id, "Relay member gone");
}
