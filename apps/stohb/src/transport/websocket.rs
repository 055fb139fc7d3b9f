//! Transport backed by the stohb-road relay broker.
//!
//! One websocket per endpoint carries registration, offers and relayed channel
//! frames. Channels are multiplexed by `connection_id`. When the socket drops
//! every relayed channel goes with it and the owner is told with
//! [`TransportEvent::Disconnected`]; [`Transport::reconnect`] opens a fresh
//! socket and registers the same code again.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::{
    ChannelEvent, ChannelLink, Direction, RawChannel, Transport, TransportError, TransportEvent,
    new_connection_id,
};
use crate::identity::PeerCode;
use crate::protocol::signaling::{ClientMessage, RegisterRejection, ServerMessage};

struct ChannelEntry {
    remote: PeerCode,
    events: mpsc::UnboundedSender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct RelayState {
    local: Option<PeerCode>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    registered: bool,
    /// Bumped for every socket so tasks of a replaced socket stay quiet.
    epoch: u64,
    channels: HashMap<String, ChannelEntry>,
    socket: Option<JoinHandle<()>>,
    /// Writer and heartbeat of the current socket.
    tasks: Vec<JoinHandle<()>>,
}

impl RelayState {
    fn abort_all(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.abort();
        }
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

struct Shared {
    url: Url,
    heartbeat: Duration,
    state: Mutex<RelayState>,
}

impl Shared {
    fn emit(&self, epoch: u64, event: TransportEvent) {
        let state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        if let Some(events) = &state.events {
            let _ = events.send(event);
        }
    }

    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        let state = self.state.lock();
        let outbound = state.outbound.as_ref().ok_or(TransportError::NotRegistered)?;
        outbound
            .send(message)
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn insert_channel(
        self: &Arc<Self>,
        remote: &PeerCode,
        connection_id: &str,
    ) -> (mpsc::UnboundedReceiver<ChannelEvent>, Arc<RelayLink>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.state.lock().channels.insert(
            connection_id.to_string(),
            ChannelEntry {
                remote: remote.clone(),
                events: tx.clone(),
                closed: Arc::clone(&closed),
            },
        );
        (rx, Arc::new(RelayLink::new(self, remote, connection_id, tx, closed)))
    }

    fn deliver(&self, connection_id: &str, event: ChannelEvent) {
        let state = self.state.lock();
        match state.channels.get(connection_id) {
            Some(entry) => {
                let _ = entry.events.send(event);
            }
            None => tracing::trace!(
                target = "stohb::transport",
                connection_id,
                "frame for unknown channel dropped"
            ),
        }
    }

    fn finish_channel(&self, connection_id: &str, event: ChannelEvent) {
        let entry = self.state.lock().channels.remove(connection_id);
        if let Some(entry) = entry {
            entry.closed.store(true, Ordering::SeqCst);
            let _ = entry.events.send(event);
        }
    }

    /// Tear down the socket identified by `epoch`, closing every relayed
    /// channel. Returns false when a newer socket already replaced it.
    fn drop_socket(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }
        state.outbound = None;
        state.registered = false;
        for (connection_id, entry) in state.channels.drain() {
            tracing::debug!(
                target = "stohb::transport",
                remote = %entry.remote,
                connection_id = %connection_id,
                "relayed channel closed with its socket"
            );
            entry.closed.store(true, Ordering::SeqCst);
            let _ = entry.events.send(ChannelEvent::Close);
        }
        for handle in state.tasks.drain(..) {
            handle.abort();
        }
        true
    }
}

/// [`Transport`] that talks to a stohb-road broker over a websocket.
pub struct RelayTransport {
    shared: Arc<Shared>,
}

impl RelayTransport {
    pub fn new(signaling_url: &str, heartbeat: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            shared: Arc::new(Shared {
                url: derive_websocket_url(signaling_url)?,
                heartbeat,
                state: Mutex::new(RelayState::default()),
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    fn open_socket(&self) -> Result<(), TransportError> {
        let (local, epoch) = {
            let mut state = self.shared.state.lock();
            let local = state.local.clone().ok_or(TransportError::NotRegistered)?;
            state.abort_all();
            state.outbound = None;
            state.registered = false;
            state.epoch += 1;
            (local, state.epoch)
        };
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run_socket(shared, local, epoch));
        self.shared.state.lock().socket = Some(handle);
        Ok(())
    }
}

impl Transport for RelayTransport {
    fn start(
        &self,
        local: &PeerCode,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.state.lock();
            if state.events.is_some() {
                return Err(TransportError::Setup("transport already started".into()));
            }
            state.local = Some(local.clone());
            state.events = Some(tx);
        }
        self.open_socket()?;
        Ok(rx)
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        self.open_socket()
    }

    fn dial(&self, remote: &PeerCode) -> Result<RawChannel, TransportError> {
        if !self.shared.state.lock().registered {
            return Err(TransportError::NotRegistered);
        }
        let connection_id = new_connection_id();
        let (events, link) = self.shared.insert_channel(remote, &connection_id);
        if let Err(err) = self.shared.send(ClientMessage::Offer {
            to_peer: remote.clone(),
            connection_id: connection_id.clone(),
        }) {
            self.shared.state.lock().channels.remove(&connection_id);
            return Err(err);
        }
        tracing::debug!(
            target = "stohb::transport",
            remote = %remote,
            connection_id = %connection_id,
            "sent offer"
        );
        Ok(RawChannel {
            remote: remote.clone(),
            connection_id,
            direction: Direction::Outgoing,
            link,
            events,
        })
    }

    fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.epoch += 1;
        state.events = None;
        state.outbound = None;
        state.registered = false;
        state.local = None;
        for (_, entry) in state.channels.drain() {
            entry.closed.store(true, Ordering::SeqCst);
        }
        state.abort_all();
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_socket(shared: Arc<Shared>, local: PeerCode, epoch: u64) {
    let (ws_stream, _) = match connect_async(shared.url.as_str()).await {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(
                target = "stohb::transport",
                url = %shared.url,
                error = %err,
                "relay connect failed"
            );
            shared.emit(
                epoch,
                TransportEvent::Error(TransportError::Setup(format!(
                    "websocket connect failed: {err}"
                ))),
            );
            if shared.drop_socket(epoch) {
                shared.emit(epoch, TransportEvent::Disconnected);
            }
            return;
        }
    };
    tracing::debug!(target = "stohb::transport", url = %shared.url, "relay websocket connected");
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = send_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(target = "stohb::transport", error = %err, "encode failed");
                    continue;
                }
            };
            if ws_write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    let heartbeat_tx = send_tx.clone();
    let period = shared.heartbeat;
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                break;
            }
        }
    });

    {
        let mut state = shared.state.lock();
        if state.epoch != epoch {
            writer.abort();
            heartbeat.abort();
            return;
        }
        state.outbound = Some(send_tx.clone());
        state.tasks.push(writer);
        state.tasks.push(heartbeat);
    }

    if send_tx
        .send(ClientMessage::Register {
            peer_id: local.clone(),
        })
        .is_err()
    {
        return;
    }

    while let Some(frame) = ws_read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                tracing::trace!(target = "stohb::transport", event = "ws_in", len = text.len());
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => handle_server_message(&shared, &local, epoch, message),
                    Err(err) => tracing::debug!(
                        target = "stohb::transport",
                        error = %err,
                        "ignoring unparseable broker frame"
                    ),
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        tracing::debug!(target = "stohb::transport", "relay websocket closed: {err}");
                    }
                    _ => {
                        tracing::warn!(target = "stohb::transport", "relay websocket error: {err}");
                    }
                }
                break;
            }
        }
    }

    if shared.drop_socket(epoch) {
        shared.emit(epoch, TransportEvent::Disconnected);
    }
}

fn handle_server_message(shared: &Arc<Shared>, local: &PeerCode, epoch: u64, message: ServerMessage) {
    match message {
        ServerMessage::Registered { peer_id } => {
            {
                let mut state = shared.state.lock();
                if state.epoch != epoch {
                    return;
                }
                state.registered = true;
            }
            tracing::debug!(target = "stohb::transport", peer_id = %peer_id, "registered with relay");
            shared.emit(epoch, TransportEvent::Open(peer_id));
        }
        ServerMessage::RegisterError { reason } => {
            let err = match reason {
                RegisterRejection::IdTaken => TransportError::IdTaken(local.clone()),
                other => TransportError::Rejected(other.as_str().to_string()),
            };
            shared.emit(epoch, TransportEvent::Error(err));
        }
        ServerMessage::Offer {
            from_peer,
            connection_id,
        } => {
            let (events, link) = shared.insert_channel(&from_peer, &connection_id);
            if let Err(err) = shared.send(ClientMessage::Answer {
                to_peer: from_peer.clone(),
                connection_id: connection_id.clone(),
            }) {
                tracing::debug!(target = "stohb::transport", error = %err, "answer not sent");
                shared.state.lock().channels.remove(&connection_id);
                return;
            }
            shared.emit(
                epoch,
                TransportEvent::Incoming(RawChannel {
                    remote: from_peer,
                    connection_id: connection_id.clone(),
                    direction: Direction::Incoming,
                    link,
                    events,
                }),
            );
            shared.deliver(&connection_id, ChannelEvent::Open);
        }
        ServerMessage::Answer { connection_id, .. } => {
            shared.deliver(&connection_id, ChannelEvent::Open);
        }
        ServerMessage::Data {
            connection_id,
            payload,
            ..
        } => {
            shared.deliver(&connection_id, ChannelEvent::Data(payload));
        }
        ServerMessage::Close { connection_id, .. } => {
            shared.finish_channel(&connection_id, ChannelEvent::Close);
        }
        ServerMessage::PeerUnavailable {
            peer_id,
            connection_id,
        } => {
            shared.finish_channel(
                &connection_id,
                ChannelEvent::Error(TransportError::PeerUnavailable(peer_id)),
            );
        }
        ServerMessage::Pong => {
            tracing::trace!(target = "stohb::transport", "pong");
        }
        ServerMessage::Error { message } => {
            shared.emit(epoch, TransportEvent::Error(TransportError::Other(message)));
        }
    }
}

struct RelayLink {
    shared: Weak<Shared>,
    remote: PeerCode,
    connection_id: String,
    own: mpsc::UnboundedSender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

impl RelayLink {
    fn new(
        shared: &Arc<Shared>,
        remote: &PeerCode,
        connection_id: &str,
        own: mpsc::UnboundedSender<ChannelEvent>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            remote: remote.clone(),
            connection_id: connection_id.to_string(),
            own,
            closed,
        }
    }
}

impl ChannelLink for RelayLink {
    fn send(&self, payload: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        let shared = self.shared.upgrade().ok_or(TransportError::ChannelClosed)?;
        shared.send(ClientMessage::Data {
            to_peer: self.remote.clone(),
            connection_id: self.connection_id.clone(),
            payload,
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.state.lock().channels.remove(&self.connection_id);
            let _ = shared.send(ClientMessage::Close {
                to_peer: self.remote.clone(),
                connection_id: self.connection_id.clone(),
            });
        }
        let _ = self.own.send(ChannelEvent::Close);
    }
}

/// Turn a broker base URL into its websocket endpoint.
///
/// `http(s)` maps to `ws(s)`; a bare host gets the `/ws` path.
pub fn derive_websocket_url(signaling_url: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(signaling_url).map_err(|err| {
        TransportError::Setup(format!("invalid signaling url {signaling_url}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported signaling url scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("invalid websocket scheme".into()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    url.set_fragment(None);
    Ok(url)
}
