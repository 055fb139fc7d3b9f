use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::identity::PeerCode;
use crate::transport::{ChannelEvent, ChannelLink, RawChannel, TransportError};

pub use crate::transport::Direction;

/// Identifies one [`SessionChannel`] for its whole life. Events tagged with a
/// generation the registry no longer holds are stale and get ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Pending,
    Open,
    Closed,
}

/// One logical channel to a remote peer.
///
/// Moves `Pending -> Open -> Closed` and never back. Background work tied to
/// the channel (dial timer, event pump, greet delay) is registered with
/// [`SessionChannel::attach`] and aborted when the channel closes or drops.
pub struct SessionChannel {
    remote: PeerCode,
    generation: Generation,
    direction: Direction,
    connection_id: String,
    state: ChannelState,
    link: Arc<dyn ChannelLink>,
    timer: Option<AbortHandle>,
    tasks: Vec<AbortHandle>,
}

impl SessionChannel {
    /// Wrap a raw transport channel. The returned receiver carries the
    /// channel's transport events and must be pumped by the owner.
    pub fn adopt(
        raw: RawChannel,
        generation: Generation,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let RawChannel {
            remote,
            connection_id,
            direction,
            link,
            events,
        } = raw;
        let channel = Self {
            remote,
            generation,
            direction,
            connection_id,
            state: ChannelState::Pending,
            link,
            timer: None,
            tasks: Vec::new(),
        };
        (channel, events)
    }

    pub fn remote(&self) -> &PeerCode {
        &self.remote
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// `Pending -> Open`. Cancels the dial timer. Returns false for any other
    /// starting state.
    pub(crate) fn mark_open(&mut self) -> bool {
        if self.state != ChannelState::Pending {
            return false;
        }
        self.state = ChannelState::Open;
        self.cancel_timer();
        true
    }

    pub(crate) fn set_timer(&mut self, timer: AbortHandle) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub(crate) fn attach(&mut self, task: AbortHandle) {
        self.tasks.push(task);
    }

    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.link.send(text)
    }

    /// Close the underlying link and stop everything attached to it.
    pub(crate) fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closed;
        self.cancel_timer();
        self.link.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Forget the channel after the remote side closed it.
    pub(crate) fn mark_closed(&mut self) {
        self.state = ChannelState::Closed;
        self.cancel_timer();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.cancel_timer();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionChannel")
            .field("remote", &self.remote)
            .field("generation", &self.generation)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
