use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use stohb_core::identity::PeerCode;
use stohb_core::protocol::signaling::{ClientMessage, RegisterRejection, ServerMessage};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::config::Config;

/// Room for the JSON envelope around a relayed payload.
const FRAME_OVERHEAD: usize = 4 * 1024;

/// A registered socket, as seen by every other socket
#[derive(Clone)]
struct PeerConnection {
    socket_id: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_seen: Arc<AtomicU64>,
    evict: Arc<Notify>,
}

/// One offered channel between two codes
#[derive(Debug, Clone)]
struct Link {
    caller: PeerCode,
    callee: PeerCode,
}

impl Link {
    fn other_end(&self, code: &PeerCode) -> Option<&PeerCode> {
        if &self.caller == code {
            Some(&self.callee)
        } else if &self.callee == code {
            Some(&self.caller)
        } else {
            None
        }
    }
}

/// Per-socket state owned by the socket task
pub(crate) struct Connection {
    socket_id: u64,
    code: Option<PeerCode>,
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_seen: Arc<AtomicU64>,
    evict: Arc<Notify>,
    remote_addr: Option<SocketAddr>,
}

impl Connection {
    fn reply(&self, message: ServerMessage) {
        let _ = self.tx.send(message);
    }

    fn error(&self, message: impl Into<String>) {
        self.reply(ServerMessage::Error {
            message: message.into(),
        });
    }
}

struct Inner {
    /// Map of pairing code -> live socket
    peers: DashMap<PeerCode, PeerConnection>,
    /// Map of connection_id -> the two codes it joins
    links: DashMap<String, Link>,
    started: Instant,
    next_socket: AtomicU64,
    heartbeat_timeout: Duration,
    max_payload_bytes: usize,
}

/// Global state for managing WebSocket connections
#[derive(Clone)]
pub struct SignalingState {
    inner: Arc<Inner>,
}

impl SignalingState {
    /// Build the state and start its heartbeat monitor. The monitor stops
    /// once the last clone is dropped.
    pub fn new(config: &Config) -> Self {
        let state = Self {
            inner: Arc::new(Inner {
                peers: DashMap::new(),
                links: DashMap::new(),
                started: Instant::now(),
                next_socket: AtomicU64::new(1),
                heartbeat_timeout: config.heartbeat_timeout,
                max_payload_bytes: config.max_payload_bytes,
            }),
        };

        let monitor = Arc::downgrade(&state.inner);
        let period = (config.heartbeat_timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(monitor_heartbeats(monitor, period));

        state
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Registered codes, sorted
    pub fn peer_codes(&self) -> Vec<PeerCode> {
        let mut codes: Vec<PeerCode> = self
            .inner
            .peers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        codes.sort();
        codes
    }

    pub fn is_registered(&self, code: &PeerCode) -> bool {
        self.inner.peers.contains_key(code)
    }

    pub fn link_count(&self) -> usize {
        self.inner.links.len()
    }

    /// Largest websocket frame accepted from a client
    fn frame_limit(&self) -> usize {
        self.inner.max_payload_bytes.saturating_add(FRAME_OVERHEAD)
    }

    fn now_ms(&self) -> u64 {
        self.inner.started.elapsed().as_millis() as u64
    }

    pub(crate) fn connect(
        &self,
        tx: mpsc::UnboundedSender<ServerMessage>,
        remote_addr: Option<SocketAddr>,
    ) -> Connection {
        Connection {
            socket_id: self.inner.next_socket.fetch_add(1, Ordering::Relaxed),
            code: None,
            tx,
            last_seen: Arc::new(AtomicU64::new(self.now_ms())),
            evict: Arc::new(Notify::new()),
            remote_addr,
        }
    }

    pub(crate) fn handle_text(&self, conn: &mut Connection, text: &str) {
        conn.last_seen.store(self.now_ms(), Ordering::Relaxed);
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                if is_register_frame(text) {
                    conn.reply(ServerMessage::RegisterError {
                        reason: RegisterRejection::InvalidId,
                    });
                } else {
                    warn!(socket = conn.socket_id, error = %err, "failed to parse client message");
                    conn.error(format!("Invalid message format: {err}"));
                }
                return;
            }
        };

        match message {
            ClientMessage::Register { peer_id } => self.register(conn, peer_id),
            ClientMessage::Ping => conn.reply(ServerMessage::Pong),
            other => {
                let Some(me) = conn.code.clone() else {
                    conn.error("Register a code before opening channels");
                    return;
                };
                self.route(conn, me, other);
            }
        }
    }

    fn register(&self, conn: &mut Connection, code: PeerCode) {
        if let Some(current) = &conn.code {
            if current == &code {
                conn.reply(ServerMessage::Registered { peer_id: code });
            } else {
                conn.reply(ServerMessage::RegisterError {
                    reason: RegisterRejection::AlreadyRegistered,
                });
            }
            return;
        }

        match self.inner.peers.entry(code.clone()) {
            Entry::Occupied(_) => {
                debug!(socket = conn.socket_id, peer = %code, "code already taken");
                conn.reply(ServerMessage::RegisterError {
                    reason: RegisterRejection::IdTaken,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(PeerConnection {
                    socket_id: conn.socket_id,
                    tx: conn.tx.clone(),
                    last_seen: Arc::clone(&conn.last_seen),
                    evict: Arc::clone(&conn.evict),
                });
                info!(
                    socket = conn.socket_id,
                    peer = %code,
                    remote_addr = ?conn.remote_addr,
                    "peer registered"
                );
                conn.code = Some(code.clone());
                conn.reply(ServerMessage::Registered { peer_id: code });
            }
        }
    }

    fn route(&self, conn: &Connection, me: PeerCode, message: ClientMessage) {
        match message {
            ClientMessage::Offer {
                to_peer,
                connection_id,
            } => {
                if to_peer == me || !self.inner.peers.contains_key(&to_peer) {
                    debug!(peer = %me, to = %to_peer, "offer to unknown code");
                    conn.reply(ServerMessage::PeerUnavailable {
                        peer_id: to_peer,
                        connection_id,
                    });
                    return;
                }
                self.inner.links.insert(
                    connection_id.clone(),
                    Link {
                        caller: me.clone(),
                        callee: to_peer.clone(),
                    },
                );
                let offer = ServerMessage::Offer {
                    from_peer: me,
                    connection_id: connection_id.clone(),
                };
                if !self.send_to(&to_peer, offer) {
                    self.inner.links.remove(&connection_id);
                    conn.reply(ServerMessage::PeerUnavailable {
                        peer_id: to_peer,
                        connection_id,
                    });
                }
            }
            ClientMessage::Answer {
                to_peer,
                connection_id,
            } => {
                let answer = ServerMessage::Answer {
                    from_peer: me,
                    connection_id: connection_id.clone(),
                };
                self.relay(conn, to_peer, connection_id, answer);
            }
            ClientMessage::Data {
                to_peer,
                connection_id,
                payload,
            } => {
                if payload.len() > self.inner.max_payload_bytes {
                    warn!(
                        peer = %me,
                        bytes = payload.len(),
                        limit = self.inner.max_payload_bytes,
                        "dropping oversize payload"
                    );
                    conn.error(format!(
                        "Payload of {} bytes exceeds the {} byte limit",
                        payload.len(),
                        self.inner.max_payload_bytes
                    ));
                    return;
                }
                let data = ServerMessage::Data {
                    from_peer: me,
                    connection_id: connection_id.clone(),
                    payload,
                };
                self.relay(conn, to_peer, connection_id, data);
            }
            ClientMessage::Close {
                to_peer,
                connection_id,
            } => {
                self.inner.links.remove(&connection_id);
                self.send_to(
                    &to_peer,
                    ServerMessage::Close {
                        from_peer: me,
                        connection_id,
                    },
                );
            }
            ClientMessage::Register { .. } | ClientMessage::Ping => {}
        }
    }

    /// Forward a channel frame. If the target is gone the sender learns
    /// through a `close` for that channel.
    fn relay(&self, conn: &Connection, to_peer: PeerCode, connection_id: String, message: ServerMessage) {
        if self.send_to(&to_peer, message) {
            return;
        }
        debug!(to = %to_peer, connection_id = %connection_id, "relay target gone");
        self.inner.links.remove(&connection_id);
        conn.reply(ServerMessage::Close {
            from_peer: to_peer,
            connection_id,
        });
    }

    fn send_to(&self, code: &PeerCode, message: ServerMessage) -> bool {
        match self.inner.peers.get(code) {
            Some(peer) => peer.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Release the socket's code and close every link it took part in.
    pub(crate) fn disconnect(&self, conn: &Connection) {
        let Some(code) = conn.code.as_ref() else {
            return;
        };
        self.inner
            .peers
            .remove_if(code, |_, peer| peer.socket_id == conn.socket_id);

        // Collect first so no DashMap guard is held while sending.
        let orphaned: Vec<(String, PeerCode)> = self
            .inner
            .links
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .other_end(code)
                    .map(|other| (entry.key().clone(), other.clone()))
            })
            .collect();
        for (connection_id, other) in orphaned {
            self.inner.links.remove(&connection_id);
            self.send_to(
                &other,
                ServerMessage::Close {
                    from_peer: code.clone(),
                    connection_id,
                },
            );
        }
        info!(socket = conn.socket_id, peer = %code, "peer left");
    }

    fn stale_peers(&self) -> Vec<(PeerCode, Arc<Notify>)> {
        self.stale_peers_at(self.now_ms())
    }

    /// Codes whose sockets have been silent longer than the timeout at `now`.
    fn stale_peers_at(&self, now: u64) -> Vec<(PeerCode, Arc<Notify>)> {
        let timeout = self.inner.heartbeat_timeout.as_millis() as u64;
        self.inner
            .peers
            .iter()
            .filter(|entry| {
                now.saturating_sub(entry.value().last_seen.load(Ordering::Relaxed)) > timeout
            })
            .map(|entry| (entry.key().clone(), Arc::clone(&entry.value().evict)))
            .collect()
    }
}

/// Monitor heartbeats and evict silent sockets
async fn monitor_heartbeats(state: Weak<Inner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = state.upgrade() else {
            break;
        };
        let state = SignalingState { inner };
        for (code, evict) in state.stale_peers() {
            info!(peer = %code, "evicting peer (heartbeat timeout)");
            evict.notify_one();
        }
    }
}

fn is_register_frame(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("type").and_then(|kind| kind.as_str()).map(|kind| kind == "register"))
        .unwrap_or(false)
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
) -> Response {
    let limit = state.frame_limit();
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: SignalingState, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut conn = state.connect(tx, Some(remote_addr));
    let socket_id = conn.socket_id;
    debug!(socket = socket_id, %remote_addr, "websocket connected");

    // Forward queued messages to the socket
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(socket = socket_id, error = %err, "failed to encode server message"),
            }
        }
        let _ = sender.close().await;
        debug!(socket = socket_id, "message sender task ended");
    });

    let evict = Arc::clone(&conn.evict);
    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = evict.notified() => {
                conn.error("Heartbeat timeout");
                break;
            }
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                debug!(socket = socket_id, error = %err, "websocket error");
                break;
            }
            None => break,
        };
        match msg {
            Message::Text(text) => state.handle_text(&mut conn, &text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => state.handle_text(&mut conn, &text),
                Err(_) => conn.error("Binary frames must carry UTF-8 JSON"),
            },
            Message::Ping(_) | Message::Pong(_) => {
                conn.last_seen.store(state.now_ms(), Ordering::Relaxed);
            }
            Message::Close(_) => {
                debug!(socket = socket_id, "received close frame");
                break;
            }
        }
    }

    state.disconnect(&conn);
    drop(conn);
    let _ = writer.await;
}
