//! Messages between an endpoint and the stohb-road rendezvous broker.
//!
//! The broker resolves pairing codes to live sockets and relays channel
//! traffic between them. Every relayed frame names the logical channel it
//! belongs to with `connection_id`, so two endpoints may hold several channels
//! (for example a stale one being torn down while a fresh one opens).

use serde::{Deserialize, Serialize};

use crate::identity::PeerCode;

/// Messages sent from an endpoint to the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Claim a pairing code for this socket
    Register { peer_id: PeerCode },
    /// Ask `to_peer` to open a channel
    Offer {
        to_peer: PeerCode,
        connection_id: String,
    },
    /// Accept an offer
    Answer {
        to_peer: PeerCode,
        connection_id: String,
    },
    Data {
        to_peer: PeerCode,
        connection_id: String,
        payload: String,
    },
    Close {
        to_peer: PeerCode,
        connection_id: String,
    },
    Ping,
}

/// Messages sent from the broker to an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        peer_id: PeerCode,
    },
    RegisterError {
        reason: RegisterRejection,
    },
    Offer {
        from_peer: PeerCode,
        connection_id: String,
    },
    Answer {
        from_peer: PeerCode,
        connection_id: String,
    },
    Data {
        from_peer: PeerCode,
        connection_id: String,
        payload: String,
    },
    Close {
        from_peer: PeerCode,
        connection_id: String,
    },
    /// The code named in an offer is not registered
    PeerUnavailable {
        peer_id: PeerCode,
        connection_id: String,
    },
    Pong,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegisterRejection {
    IdTaken,
    InvalidId,
    AlreadyRegistered,
}

impl RegisterRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            RegisterRejection::IdTaken => "id-taken",
            RegisterRejection::InvalidId => "invalid-id",
            RegisterRejection::AlreadyRegistered => "already-registered",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn code(s: &str) -> PeerCode {
        PeerCode::parse(s).unwrap()
    }

    #[test]
    fn client_messages_use_snake_case_tags() {
        let msg = ClientMessage::Offer {
            to_peer: code("7F3K2Q"),
            connection_id: "c1".into(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "offer", "to_peer": "7F3K2Q", "connection_id": "c1"})
        );
        assert_eq!(
            serde_json::to_value(&ClientMessage::Ping).unwrap(),
            json!({"type": "ping"})
        );
    }

    #[test]
    fn register_error_reason_is_kebab_case() {
        let msg = ServerMessage::RegisterError {
            reason: RegisterRejection::IdTaken,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "register_error", "reason": "id-taken"})
        );
    }

    #[test]
    fn lowercase_codes_from_the_wire_are_normalised() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "type": "peer_unavailable",
            "peer_id": "abc123",
            "connection_id": "c9",
        }))
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::PeerUnavailable {
                peer_id: code("ABC123"),
                connection_id: "c9".into(),
            }
        );
    }
}
