//! Application-level dispatch on top of the registry.
//!
//! The router never decides what to answer. It decodes inbound text into
//! [`InboundMessage`]s tagged with the sender, and delivers outbound messages
//! either to one open session or to all of them.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::channel::Direction;
use super::registry::ConnectionRegistry;
use crate::identity::PeerCode;
use crate::protocol::{AppMessage, ProtocolError};

/// Which side of the pairing this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Holds the sheet and hands out cells.
    Provider,
    /// Joins a provider by code and sends photos.
    Receiver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: PeerCode,
    pub message: AppMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Written to these sessions, in registry order.
    Sent(Vec<PeerCode>),
    /// The target has no open session. Nothing was sent.
    NoSession(PeerCode),
    /// Broadcast with no open sessions.
    NoSessions,
}

impl Delivery {
    pub fn recipients(&self) -> &[PeerCode] {
        match self {
            Delivery::Sent(recipients) => recipients,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MessageRouter {
    role: Role,
}

impl MessageRouter {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Joiners greet every channel they dialed once it opens.
    pub fn greets(&self, direction: Direction) -> bool {
        self.role == Role::Receiver && direction == Direction::Outgoing
    }

    /// Decode text received from `from`. Unknown kinds, foreign versions and
    /// malformed frames are logged and dropped.
    pub fn decode(&self, from: &PeerCode, text: &str) -> Option<InboundMessage> {
        match AppMessage::decode(text) {
            Ok(Some(message)) => {
                debug!(
                    target = "stohb::session",
                    remote = %from,
                    kind = message.kind(),
                    "inbound message"
                );
                Some(InboundMessage {
                    from: from.clone(),
                    message,
                })
            }
            Ok(None) => {
                debug!(target = "stohb::session", remote = %from, "ignoring unknown message kind");
                None
            }
            Err(ProtocolError::UnsupportedVersion(version)) => {
                warn!(
                    target = "stohb::session",
                    remote = %from,
                    version,
                    "ignoring message from incompatible protocol version"
                );
                None
            }
            Err(err) => {
                warn!(target = "stohb::session", remote = %from, error = %err, "dropping malformed message");
                None
            }
        }
    }

    /// Send to `target`, or to every open session when `target` is `None`.
    pub fn send(
        &self,
        registry: &ConnectionRegistry,
        message: &AppMessage,
        target: Option<&PeerCode>,
    ) -> Result<Delivery, ProtocolError> {
        let text = message.encode()?;
        let delivery = match target {
            Some(remote) => match registry.open_channel(remote) {
                Some(channel) => match channel.send_text(text) {
                    Ok(()) => Delivery::Sent(vec![remote.clone()]),
                    Err(err) => {
                        warn!(target = "stohb::session", remote = %remote, error = %err, "send failed");
                        Delivery::NoSession(remote.clone())
                    }
                },
                None => {
                    warn!(
                        target = "stohb::session",
                        remote = %remote,
                        kind = message.kind(),
                        "no open session for target, message dropped"
                    );
                    Delivery::NoSession(remote.clone())
                }
            },
            None => {
                let mut sent = Vec::new();
                for channel in registry.open_channels() {
                    match channel.send_text(text.clone()) {
                        Ok(()) => sent.push(channel.remote().clone()),
                        Err(err) => warn!(
                            target = "stohb::session",
                            remote = %channel.remote(),
                            error = %err,
                            "broadcast send failed"
                        ),
                    }
                }
                if sent.is_empty() {
                    warn!(
                        target = "stohb::session",
                        kind = message.kind(),
                        "no open sessions, broadcast dropped"
                    );
                    Delivery::NoSessions
                } else {
                    Delivery::Sent(sent)
                }
            }
        };
        Ok(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CellRef;
    use crate::session::registry::Admission;
    use crate::transport::{ChannelLink, RawChannel, TransportError};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<String>>,
    }

    impl ChannelLink for RecordingLink {
        fn send(&self, payload: String) -> Result<(), TransportError> {
            self.sent.lock().push(payload);
            Ok(())
        }

        fn close(&self) {}
    }

    fn code(s: &str) -> PeerCode {
        PeerCode::parse(s).unwrap()
    }

    fn registry_with(open: &[&str], pending: &[&str]) -> (ConnectionRegistry, Vec<Arc<RecordingLink>>) {
        let mut registry = ConnectionRegistry::new();
        let mut links = Vec::new();
        for (remote, is_open) in open
            .iter()
            .map(|r| (r, true))
            .chain(pending.iter().map(|r| (r, false)))
        {
            let link = Arc::new(RecordingLink::default());
            let raw = RawChannel {
                remote: code(remote),
                connection_id: remote.to_string(),
                direction: Direction::Incoming,
                link: link.clone(),
                events: mpsc::unbounded_channel().1,
            };
            let Admission::Accepted { generation, .. } = registry.on_incoming(raw) else {
                panic!("rejected");
            };
            if is_open {
                registry.on_open(generation);
            }
            links.push(link);
        }
        (registry, links)
    }

    #[test]
    fn broadcast_reaches_every_open_session_and_nothing_else() {
        let router = MessageRouter::new(Role::Provider);
        let message = AppMessage::Greet;

        let (registry, _) = registry_with(&[], &["PPPPPP"]);
        assert_eq!(router.send(&registry, &message, None).unwrap(), Delivery::NoSessions);

        let (registry, links) = registry_with(&["AAAAAA"], &["PPPPPP"]);
        assert_eq!(
            router.send(&registry, &message, None).unwrap(),
            Delivery::Sent(vec![code("AAAAAA")])
        );
        assert_eq!(links[0].sent.lock().len(), 1);
        assert!(links[1].sent.lock().is_empty());

        let (registry, links) = registry_with(&["AAAAAA", "BBBBBB", "CCCCCC"], &["PPPPPP"]);
        let delivery = router.send(&registry, &message, None).unwrap();
        assert_eq!(delivery.recipients().len(), 3);
        for link in &links[..3] {
            assert_eq!(link.sent.lock().len(), 1);
        }
        assert!(links[3].sent.lock().is_empty());
    }

    #[test]
    fn targeted_send_to_absent_peer_is_a_no_op() {
        let router = MessageRouter::new(Role::Provider);
        let (registry, links) = registry_with(&["AAAAAA"], &["PPPPPP"]);
        let message = AppMessage::assign(CellRef::new(1, 0), 0);

        assert_eq!(
            router.send(&registry, &message, Some(&code("ZZZZZZ"))).unwrap(),
            Delivery::NoSession(code("ZZZZZZ"))
        );
        assert_eq!(
            router.send(&registry, &message, Some(&code("PPPPPP"))).unwrap(),
            Delivery::NoSession(code("PPPPPP"))
        );
        assert_eq!(
            router.send(&registry, &message, Some(&code("AAAAAA"))).unwrap(),
            Delivery::Sent(vec![code("AAAAAA")])
        );
        let sent = links[0].sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(AppMessage::decode(&sent[0]).unwrap(), Some(message));
    }

    #[test]
    fn decode_tags_sender_and_skips_noise() {
        let router = MessageRouter::new(Role::Provider);
        let from = code("BBBBBB");
        let inbound = router.decode(&from, r#"{"type":"GREET"}"#).unwrap();
        assert_eq!(inbound.from, from);
        assert_eq!(inbound.message, AppMessage::Greet);

        assert!(router.decode(&from, r#"{"type":"WAVE"}"#).is_none());
        assert!(router.decode(&from, r#"{"type":"GREET","v":7}"#).is_none());
        assert!(router.decode(&from, "{").is_none());
    }

    #[test]
    fn only_receivers_greet_and_only_on_dialed_channels() {
        assert!(MessageRouter::new(Role::Receiver).greets(Direction::Outgoing));
        assert!(!MessageRouter::new(Role::Receiver).greets(Direction::Incoming));
        assert!(!MessageRouter::new(Role::Provider).greets(Direction::Outgoing));
    }
}
