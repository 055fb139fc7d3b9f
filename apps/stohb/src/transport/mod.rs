//! The seam between the session layer and whatever actually moves bytes.
//!
//! A [`Transport`] plays the part of a rendezvous-backed peer: it registers a
//! pairing code, dials other codes and surfaces channels that other peers
//! opened towards us. Nothing here blocks; outcomes arrive as events.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::identity::PeerCode;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryBroker, MemoryTransport};
pub use websocket::RelayTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The remote peer dialed us.
    Incoming,
    /// We dialed the remote peer.
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is unavailable")]
    PeerUnavailable(PeerCode),
    #[error("pairing code {0} is already registered")]
    IdTaken(PeerCode),
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("transport is not registered")]
    NotRegistered,
    #[error("channel closed")]
    ChannelClosed,
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// Rendezvous-level notifications.
#[derive(Debug)]
pub enum TransportEvent {
    /// The code is registered and reachable.
    Open(PeerCode),
    /// A remote peer opened a channel towards us.
    Incoming(RawChannel),
    Error(TransportError),
    /// The link to the rendezvous service dropped. Existing channels may
    /// survive, but no new ones can be dialed until [`Transport::reconnect`]
    /// succeeds.
    Disconnected,
}

/// Per-channel notifications, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Data(String),
    Close,
    Error(TransportError),
}

/// Outbound half of a raw channel.
pub trait ChannelLink: Send + Sync {
    fn send(&self, payload: String) -> Result<(), TransportError>;

    /// Close the channel. Both ends observe [`ChannelEvent::Close`]; calling
    /// it again is harmless.
    fn close(&self);
}

/// A transport-level channel before the session layer adopts it.
pub struct RawChannel {
    pub remote: PeerCode,
    pub connection_id: String,
    pub direction: Direction,
    pub link: Arc<dyn ChannelLink>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl fmt::Debug for RawChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChannel")
            .field("remote", &self.remote)
            .field("connection_id", &self.connection_id)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

pub trait Transport: Send + Sync {
    /// Begin registering `local`. Registration outcome, incoming channels and
    /// disconnects arrive on the returned receiver.
    fn start(
        &self,
        local: &PeerCode,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    /// Re-register after [`TransportEvent::Disconnected`].
    fn reconnect(&self) -> Result<(), TransportError>;

    /// Open a channel to `remote`. The channel reports `Open` once the remote
    /// side has answered; an unknown code is reported as
    /// `ChannelEvent::Error(TransportError::PeerUnavailable)`.
    fn dial(&self, remote: &PeerCode) -> Result<RawChannel, TransportError>;

    /// Release the registration. The event stream ends afterwards.
    fn stop(&self);
}

pub(crate) fn new_connection_id() -> String {
    Uuid::new_v4().to_string()
}
