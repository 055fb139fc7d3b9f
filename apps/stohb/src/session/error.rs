use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::identity::PeerCode;
use crate::transport::TransportError;

pub const DEVICE_NOT_FOUND: &str = "Device not found. Check the code.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionErrorKind {
    /// The dialed code does not answer.
    PeerUnreachable,
    /// The broker or an established channel failed.
    TransportError,
    /// Something on this side went wrong, e.g. dialing before registration.
    LocalFailure,
}

impl ConnectionErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionErrorKind::PeerUnreachable => "peer-unreachable",
            ConnectionErrorKind::TransportError => "transport-error",
            ConnectionErrorKind::LocalFailure => "local-failure",
        }
    }
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient error state shown by the host next to its connect controls.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {reason}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub reason: String,
    /// Remote the error relates to, if any.
    pub remote: Option<PeerCode>,
}

impl ConnectionError {
    pub fn new(kind: ConnectionErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: &PeerCode) -> Self {
        self.remote = Some(remote.clone());
        self
    }

    pub fn peer_unreachable(remote: &PeerCode) -> Self {
        Self::new(ConnectionErrorKind::PeerUnreachable, DEVICE_NOT_FOUND).with_remote(remote)
    }

    pub fn local(reason: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::LocalFailure, reason)
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PeerUnavailable(remote) => Self::peer_unreachable(&remote),
            TransportError::NotRegistered => {
                Self::local("Not connected to the pairing service yet.")
            }
            TransportError::IdTaken(code) => Self::local(format!(
                "Pairing code {code} is already in use. Restart to get a new one."
            )),
            other => Self::new(ConnectionErrorKind::TransportError, other.to_string()),
        }
    }
}
