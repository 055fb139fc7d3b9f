//! Live channels keyed by remote identity.
//!
//! The registry keeps at most one entry per remote code. Entries are held in
//! insertion order so hosts can list connected devices stably. Only the
//! facade's actor task mutates it.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::channel::{ChannelState, Direction, Generation, SessionChannel};
use super::error::{ConnectionError, ConnectionErrorKind};
use crate::identity::PeerCode;
use crate::transport::{ChannelEvent, RawChannel, Transport, TransportError};

#[derive(Debug)]
pub enum Admission {
    /// The incoming channel is registered as pending; its events must be
    /// pumped back into the registry tagged with `generation`.
    Accepted {
        generation: Generation,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    },
    /// An open session to the same remote already exists; the raw channel
    /// was closed.
    Rejected,
}

#[derive(Debug)]
pub enum ConnectOutcome {
    /// A channel to the remote already exists, pending or open.
    Existing {
        generation: Generation,
        state: ChannelState,
    },
    Dialed {
        generation: Generation,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    },
    Failed(ConnectionError),
}

/// What an open transition produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub remote: PeerCode,
    pub direction: Direction,
    pub generation: Generation,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: Vec<SessionChannel>,
    next_generation: u64,
    last_error: Option<ConnectionError>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> Generation {
        self.next_generation += 1;
        Generation(self.next_generation)
    }

    fn position(&self, generation: Generation) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.generation() == generation)
    }

    fn position_of_remote(&self, remote: &PeerCode) -> Option<usize> {
        self.entries.iter().position(|entry| entry.remote() == remote)
    }

    fn evict_at(&mut self, index: usize) -> SessionChannel {
        let mut entry = self.entries.remove(index);
        entry.close();
        entry
    }

    pub fn on_incoming(&mut self, raw: RawChannel) -> Admission {
        if let Some(index) = self.position_of_remote(&raw.remote) {
            if self.entries[index].is_open() {
                debug!(
                    target = "stohb::session",
                    remote = %raw.remote,
                    connection_id = %raw.connection_id,
                    "rejecting duplicate incoming channel"
                );
                raw.link.close();
                return Admission::Rejected;
            }
            let stale = self.evict_at(index);
            debug!(
                target = "stohb::session",
                remote = %stale.remote(),
                generation = %stale.generation(),
                "evicted half-open channel for fresh incoming one"
            );
        }
        let generation = self.allocate();
        let (channel, events) = SessionChannel::adopt(raw, generation);
        debug!(
            target = "stohb::session",
            remote = %channel.remote(),
            generation = %generation,
            "incoming channel pending"
        );
        self.entries.push(channel);
        Admission::Accepted { generation, events }
    }

    /// Dial `remote` unless a channel to it already exists.
    pub fn connect(&mut self, transport: &dyn Transport, remote: &PeerCode) -> ConnectOutcome {
        self.last_error = None;
        if let Some(index) = self.position_of_remote(remote) {
            let entry = &self.entries[index];
            return ConnectOutcome::Existing {
                generation: entry.generation(),
                state: entry.state(),
            };
        }
        let raw = match transport.dial(remote) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target = "stohb::session", remote = %remote, error = %err, "dial failed");
                let err = ConnectionError::from(err);
                self.last_error = Some(err.clone());
                return ConnectOutcome::Failed(err);
            }
        };
        let generation = self.allocate();
        let (channel, events) = SessionChannel::adopt(raw, generation);
        debug!(
            target = "stohb::session",
            remote = %remote,
            generation = %generation,
            "outgoing channel pending"
        );
        self.entries.push(channel);
        ConnectOutcome::Dialed { generation, events }
    }

    pub fn on_open(&mut self, generation: Generation) -> Option<Opened> {
        let index = self.position(generation)?;
        if !self.entries[index].mark_open() {
            return None;
        }
        let remote = self.entries[index].remote().clone();
        let direction = self.entries[index].direction();

        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].remote() == &remote && self.entries[i].generation() != generation {
                let superseded = self.evict_at(i);
                debug!(
                    target = "stohb::session",
                    remote = %remote,
                    generation = %superseded.generation(),
                    "superseded by fresher channel"
                );
            } else {
                i += 1;
            }
        }

        self.last_error = None;
        info!(
            target = "stohb::session",
            remote = %remote,
            generation = %generation,
            direction = ?direction,
            "session open"
        );
        Some(Opened {
            remote,
            direction,
            generation,
        })
    }

    /// Remote of an open channel that delivered data, if the data should be
    /// routed at all.
    pub fn on_data(&self, generation: Generation) -> Option<&PeerCode> {
        let index = self.position(generation)?;
        let entry = &self.entries[index];
        if !entry.is_open() {
            debug!(
                target = "stohb::session",
                remote = %entry.remote(),
                generation = %generation,
                "dropping data on channel that is not open"
            );
            return None;
        }
        Some(entry.remote())
    }

    pub fn on_close(&mut self, generation: Generation) -> Option<PeerCode> {
        let index = self.position(generation)?;
        let mut entry = self.entries.remove(index);
        let was_open = entry.is_open();
        entry.mark_closed();
        info!(
            target = "stohb::session",
            remote = %entry.remote(),
            generation = %generation,
            was_open,
            "session closed"
        );
        Some(entry.remote().clone())
    }

    pub fn on_error(&mut self, generation: Generation, err: TransportError) {
        let Some(index) = self.position(generation) else {
            return;
        };
        let pending = self.entries[index].state() == ChannelState::Pending;
        if pending && matches!(err, TransportError::PeerUnavailable(_)) {
            let entry = self.evict_at(index);
            warn!(
                target = "stohb::session",
                remote = %entry.remote(),
                "peer unavailable"
            );
            self.last_error = Some(ConnectionError::peer_unreachable(entry.remote()));
            return;
        }
        let remote = self.entries[index].remote().clone();
        warn!(target = "stohb::session", remote = %remote, error = %err, "channel error");
        self.last_error = Some(ConnectionError::from(err).with_remote(&remote));
    }

    /// The dial timer fired. Evicts the entry if it is still pending.
    pub fn on_timeout(&mut self, generation: Generation) -> bool {
        let Some(index) = self.position(generation) else {
            return false;
        };
        if self.entries[index].state() != ChannelState::Pending {
            return false;
        }
        let entry = self.evict_at(index);
        warn!(
            target = "stohb::session",
            remote = %entry.remote(),
            generation = %generation,
            "dial timed out"
        );
        self.last_error = Some(ConnectionError::peer_unreachable(entry.remote()));
        true
    }

    pub fn get(&self, generation: Generation) -> Option<&SessionChannel> {
        self.position(generation).map(|index| &self.entries[index])
    }

    pub fn get_mut(&mut self, generation: Generation) -> Option<&mut SessionChannel> {
        self.position(generation)
            .map(move |index| &mut self.entries[index])
    }

    pub fn open_channel(&self, remote: &PeerCode) -> Option<&SessionChannel> {
        self.entries
            .iter()
            .find(|entry| entry.is_open() && entry.remote() == remote)
    }

    pub fn open_channels(&self) -> impl Iterator<Item = &SessionChannel> {
        self.entries.iter().filter(|entry| entry.is_open())
    }

    pub fn open_sessions(&self) -> Vec<PeerCode> {
        self.open_channels()
            .map(|entry| entry.remote().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    pub fn set_error(&mut self, err: ConnectionError) {
        self.last_error = Some(err);
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Close the channel to `remote`, pending or open, at the host's request.
    /// Returns false when there was nothing to close.
    pub fn close_remote(&mut self, remote: &PeerCode) -> bool {
        let Some(index) = self.position_of_remote(remote) else {
            return false;
        };
        let entry = self.evict_at(index);
        info!(
            target = "stohb::session",
            remote = %remote,
            generation = %entry.generation(),
            "session closed locally"
        );
        true
    }

    pub fn close_all(&mut self) {
        for mut entry in self.entries.drain(..) {
            entry.close();
        }
    }

    pub fn error_kind(&self) -> Option<ConnectionErrorKind> {
        self.last_error.as_ref().map(|err| err.kind)
    }
}
