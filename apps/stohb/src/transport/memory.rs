//! In-process rendezvous.
//!
//! Every [`MemoryTransport`] created from the same [`MemoryBroker`] can reach
//! the others by pairing code. Channels are pairs of unbounded queues, so
//! delivery is ordered and lossless. The broker can also misbehave on purpose:
//! [`MemoryBroker::stall`] swallows offers to a code and
//! [`MemoryBroker::kick`] drops a registration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ChannelEvent, ChannelLink, Direction, RawChannel, Transport, TransportError, TransportEvent,
    new_connection_id,
};
use crate::identity::PeerCode;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

struct Endpoint {
    transport_id: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct BrokerState {
    endpoints: HashMap<PeerCode, Endpoint>,
    stalled: HashSet<PeerCode>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            broker: self.clone(),
            session: Mutex::new(None),
        }
    }

    /// Offers addressed to `code` vanish until [`MemoryBroker::resume`].
    pub fn stall(&self, code: &PeerCode) {
        self.state.lock().stalled.insert(code.clone());
    }

    pub fn resume(&self, code: &PeerCode) {
        self.state.lock().stalled.remove(code);
    }

    /// Drop the registration of `code`, as if its broker socket died.
    pub fn kick(&self, code: &PeerCode) -> bool {
        let endpoint = self.state.lock().endpoints.remove(code);
        match endpoint {
            Some(endpoint) => {
                let _ = endpoint.events.send(TransportEvent::Disconnected);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, code: &PeerCode) -> bool {
        self.state.lock().endpoints.contains_key(code)
    }

    pub fn registered(&self) -> Vec<PeerCode> {
        let mut codes: Vec<_> = self.state.lock().endpoints.keys().cloned().collect();
        codes.sort();
        codes
    }

    fn register(
        &self,
        code: &PeerCode,
        transport_id: u64,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.endpoints.get(code) {
            if existing.transport_id != transport_id {
                return Err(TransportError::IdTaken(code.clone()));
            }
            return Ok(());
        }
        state.endpoints.insert(
            code.clone(),
            Endpoint {
                transport_id,
                events: events.clone(),
            },
        );
        Ok(())
    }

    fn unregister(&self, code: &PeerCode, transport_id: u64) {
        let mut state = self.state.lock();
        if state
            .endpoints
            .get(code)
            .is_some_and(|endpoint| endpoint.transport_id == transport_id)
        {
            state.endpoints.remove(code);
        }
    }

    fn owns(&self, code: &PeerCode, transport_id: u64) -> bool {
        self.state
            .lock()
            .endpoints
            .get(code)
            .is_some_and(|endpoint| endpoint.transport_id == transport_id)
    }

    /// Deliver `channel` to whoever holds `code`. Returns whether the offer
    /// reached anyone; `None` means the code is unknown.
    fn offer(&self, code: &PeerCode, channel: RawChannel) -> Option<bool> {
        let state = self.state.lock();
        let endpoint = state.endpoints.get(code)?;
        if state.stalled.contains(code) {
            debug!(target = "stohb::transport", remote = %code, "memory broker swallowed offer");
            return Some(false);
        }
        Some(endpoint.events.send(TransportEvent::Incoming(channel)).is_ok())
    }
}

struct LocalSession {
    code: PeerCode,
    events: mpsc::UnboundedSender<TransportEvent>,
}

pub struct MemoryTransport {
    id: u64,
    broker: MemoryBroker,
    session: Mutex<Option<LocalSession>>,
}

impl MemoryTransport {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn register_current(&self) -> Result<(), TransportError> {
        let guard = self.session.lock();
        let session = guard.as_ref().ok_or(TransportError::NotRegistered)?;
        match self.broker.register(&session.code, self.id, &session.events) {
            Ok(()) => {
                let _ = session.events.send(TransportEvent::Open(session.code.clone()));
            }
            Err(err) => {
                let _ = session.events.send(TransportEvent::Error(err));
            }
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn start(
        &self,
        local: &PeerCode,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut guard = self.session.lock();
            if guard.is_some() {
                return Err(TransportError::Setup("transport already started".into()));
            }
            *guard = Some(LocalSession {
                code: local.clone(),
                events: tx,
            });
        }
        self.register_current()?;
        Ok(rx)
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        self.register_current()
    }

    fn dial(&self, remote: &PeerCode) -> Result<RawChannel, TransportError> {
        let local = {
            let guard = self.session.lock();
            let session = guard.as_ref().ok_or(TransportError::NotRegistered)?;
            session.code.clone()
        };
        if !self.broker.owns(&local, self.id) {
            return Err(TransportError::NotRegistered);
        }

        let self_dial = *remote == local;
        let connection_id = new_connection_id();
        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, callee_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let caller_link = Arc::new(MemoryLink {
            own: caller_tx.clone(),
            peer: callee_tx.clone(),
            closed: Arc::clone(&closed),
        });
        let callee_link = Arc::new(MemoryLink {
            own: callee_tx.clone(),
            peer: caller_tx.clone(),
            closed,
        });

        let callee = RawChannel {
            remote: local,
            connection_id: connection_id.clone(),
            direction: Direction::Incoming,
            link: callee_link,
            events: callee_rx,
        };

        // The relay broker refuses offers to the sender's own code.
        let offered = if self_dial {
            None
        } else {
            self.broker.offer(remote, callee)
        };
        match offered {
            None => {
                let _ = caller_tx.send(ChannelEvent::Error(TransportError::PeerUnavailable(
                    remote.clone(),
                )));
            }
            Some(true) => {
                let _ = callee_tx.send(ChannelEvent::Open);
                let _ = caller_tx.send(ChannelEvent::Open);
            }
            Some(false) => {}
        }

        Ok(RawChannel {
            remote: remote.clone(),
            connection_id,
            direction: Direction::Outgoing,
            link: caller_link,
            events: caller_rx,
        })
    }

    fn stop(&self) {
        if let Some(session) = self.session.lock().take() {
            self.broker.unregister(&session.code, self.id);
        }
    }
}

struct MemoryLink {
    own: mpsc::UnboundedSender<ChannelEvent>,
    peer: mpsc::UnboundedSender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

impl ChannelLink for MemoryLink {
    fn send(&self, payload: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.peer
            .send(ChannelEvent::Data(payload))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.own.send(ChannelEvent::Close);
        let _ = self.peer.send(ChannelEvent::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> PeerCode {
        PeerCode::parse(s).unwrap()
    }

    async fn expect_open(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> PeerCode {
        match rx.recv().await {
            Some(TransportEvent::Open(code)) => code,
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn dial_delivers_incoming_and_opens_both_ends() {
        let broker = MemoryBroker::new();
        let a = broker.transport();
        let b = broker.transport();
        let mut a_events = a.start(&code("AAAAAA")).unwrap();
        let mut b_events = b.start(&code("BBBBBB")).unwrap();
        expect_open(&mut a_events).await;
        expect_open(&mut b_events).await;

        let mut outgoing = b.dial(&code("AAAAAA")).unwrap();
        let mut incoming = match a_events.recv().await {
            Some(TransportEvent::Incoming(raw)) => raw,
            other => panic!("expected incoming, got {other:?}"),
        };
        assert_eq!(incoming.remote, code("BBBBBB"));
        assert_eq!(incoming.direction, Direction::Incoming);
        assert_eq!(incoming.connection_id, outgoing.connection_id);
        assert_eq!(outgoing.events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(incoming.events.recv().await, Some(ChannelEvent::Open));

        outgoing.link.send("one".into()).unwrap();
        outgoing.link.send("two".into()).unwrap();
        assert_eq!(incoming.events.recv().await, Some(ChannelEvent::Data("one".into())));
        assert_eq!(incoming.events.recv().await, Some(ChannelEvent::Data("two".into())));

        incoming.link.close();
        assert_eq!(incoming.events.recv().await, Some(ChannelEvent::Close));
        assert_eq!(outgoing.events.recv().await, Some(ChannelEvent::Close));
        assert_eq!(
            outgoing.link.send("late".into()),
            Err(TransportError::ChannelClosed)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_code_is_reported_on_the_channel() {
        let broker = MemoryBroker::new();
        let a = broker.transport();
        let mut events = a.start(&code("AAAAAA")).unwrap();
        expect_open(&mut events).await;

        let mut raw = a.dial(&code("NOBODY")).unwrap();
        assert_eq!(
            raw.events.recv().await,
            Some(ChannelEvent::Error(TransportError::PeerUnavailable(code(
                "NOBODY"
            ))))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn dialing_own_code_is_unavailable() {
        let broker = MemoryBroker::new();
        let a = broker.transport();
        let mut events = a.start(&code("MIRROR")).unwrap();
        expect_open(&mut events).await;

        let mut raw = a.dial(&code("MIRROR")).unwrap();
        assert_eq!(
            raw.events.recv().await,
            Some(ChannelEvent::Error(TransportError::PeerUnavailable(code(
                "MIRROR"
            ))))
        );
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err(), "no incoming channel to ourselves");
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_registration_of_a_code_is_rejected() {
        let broker = MemoryBroker::new();
        let first = broker.transport();
        let second = broker.transport();
        let mut first_events = first.start(&code("SAME01")).unwrap();
        let mut second_events = second.start(&code("SAME01")).unwrap();
        expect_open(&mut first_events).await;
        match second_events.recv().await {
            Some(TransportEvent::Error(TransportError::IdTaken(taken))) => {
                assert_eq!(taken, code("SAME01"))
            }
            other => panic!("expected id taken, got {other:?}"),
        }
        assert!(matches!(
            second.dial(&code("SAME01")),
            Err(TransportError::NotRegistered)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn kick_disconnects_and_reconnect_registers_again() {
        let broker = MemoryBroker::new();
        let a = broker.transport();
        let mut events = a.start(&code("AAAAAA")).unwrap();
        expect_open(&mut events).await;

        assert!(broker.kick(&code("AAAAAA")));
        assert!(matches!(events.recv().await, Some(TransportEvent::Disconnected)));
        assert!(!broker.is_registered(&code("AAAAAA")));

        a.reconnect().unwrap();
        expect_open(&mut events).await;
        assert_eq!(broker.registered(), vec![code("AAAAAA")]);

        a.stop();
        assert!(broker.registered().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn stalled_peer_never_sees_the_offer() {
        let broker = MemoryBroker::new();
        let a = broker.transport();
        let b = broker.transport();
        let mut a_events = a.start(&code("AAAAAA")).unwrap();
        let mut b_events = b.start(&code("BBBBBB")).unwrap();
        expect_open(&mut a_events).await;
        expect_open(&mut b_events).await;

        broker.stall(&code("AAAAAA"));
        let mut raw = b.dial(&code("AAAAAA")).unwrap();
        tokio::task::yield_now().await;
        assert!(raw.events.try_recv().is_err());
        assert!(a_events.try_recv().is_err());
    }
}
