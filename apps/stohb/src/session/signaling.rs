//! Registration with the rendezvous service and keeping it alive.

use std::future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Sleep, sleep};
use tracing::{debug, info, warn};

use crate::identity::PeerCode;
use crate::transport::{RawChannel, Transport, TransportError, TransportEvent};

#[derive(Debug)]
pub enum SignalingEvent {
    /// First successful registration. Emitted once per [`SignalingClient::start`].
    Ready(PeerCode),
    /// Registration restored after a disconnect.
    Reconnected(PeerCode),
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted. Nothing further is attempted.
    Failed { attempts: u32 },
    TransportError(TransportError),
    Incoming(RawChannel),
}

/// Exponential backoff for re-registering after the broker link drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

pub struct SignalingClient {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    task: Option<JoinHandle<()>>,
}

impl SignalingClient {
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            task: None,
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Register `local` and start watching the registration.
    pub fn start(
        &mut self,
        local: &PeerCode,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, TransportError> {
        if self.task.is_some() {
            return Err(TransportError::Setup("signaling already started".into()));
        }
        let transport_events = self.transport.start(local)?;
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(target = "stohb::signaling", local = %local, "registering");
        self.task = Some(tokio::spawn(supervise(
            Arc::clone(&self.transport),
            self.policy,
            transport_events,
            tx,
        )));
        Ok(rx)
    }

    /// Release the registration. Channels derived from it are the caller's
    /// to close.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.transport.stop();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.stop();
        }
    }
}

async fn supervise(
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    events: mpsc::UnboundedSender<SignalingEvent>,
) {
    let mut ready_sent = false;
    let mut attempt = 0u32;
    let mut retry: Option<Pin<Box<Sleep>>> = None;
    let mut gave_up = false;

    loop {
        let outgoing = tokio::select! {
            event = transport_events.recv() => {
                let Some(event) = event else { break };
                match event {
                    TransportEvent::Open(code) => {
                        attempt = 0;
                        retry = None;
                        gave_up = false;
                        if ready_sent {
                            info!(target = "stohb::signaling", local = %code, "registration restored");
                            vec![SignalingEvent::Reconnected(code)]
                        } else {
                            ready_sent = true;
                            info!(target = "stohb::signaling", local = %code, "registered");
                            vec![SignalingEvent::Ready(code)]
                        }
                    }
                    TransportEvent::Incoming(raw) => vec![SignalingEvent::Incoming(raw)],
                    TransportEvent::Error(err) => {
                        warn!(target = "stohb::signaling", error = %err, "transport error");
                        vec![SignalingEvent::TransportError(err)]
                    }
                    TransportEvent::Disconnected => {
                        warn!(target = "stohb::signaling", "broker connection lost");
                        let mut out = vec![SignalingEvent::Disconnected];
                        if retry.is_none() && !gave_up {
                            out.push(schedule(&policy, &mut attempt, &mut retry, &mut gave_up));
                        }
                        out
                    }
                }
            }
            _ = async {
                match retry.as_mut() {
                    Some(delay) => delay.await,
                    None => future::pending().await,
                }
            } => {
                retry = None;
                debug!(target = "stohb::signaling", attempt, "re-registering");
                match transport.reconnect() {
                    Ok(()) => Vec::new(),
                    Err(err) => vec![
                        SignalingEvent::TransportError(err),
                        schedule(&policy, &mut attempt, &mut retry, &mut gave_up),
                    ],
                }
            }
        };

        for event in outgoing {
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

fn schedule(
    policy: &ReconnectPolicy,
    attempt: &mut u32,
    retry: &mut Option<Pin<Box<Sleep>>>,
    gave_up: &mut bool,
) -> SignalingEvent {
    if *attempt >= policy.max_attempts {
        *gave_up = true;
        warn!(
            target = "stohb::signaling",
            attempts = *attempt,
            "giving up on the broker"
        );
        return SignalingEvent::Failed { attempts: *attempt };
    }
    *attempt += 1;
    let delay = policy.delay_for(*attempt);
    *retry = Some(Box::pin(sleep(delay)));
    SignalingEvent::Reconnecting {
        attempt: *attempt,
        delay,
    }
}
