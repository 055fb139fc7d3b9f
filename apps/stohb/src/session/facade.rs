//! The one object a host application holds.
//!
//! A [`ConnectionFacade`] is a handle to an actor task that owns the
//! registry, the signaling client and the router. Every mutation of session
//! state happens on that task; the handle only sends commands and reads the
//! latest published [`FacadeState`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::channel::{ChannelState, Generation};
use super::error::{ConnectionError, ConnectionErrorKind};
use super::registry::{Admission, ConnectOutcome, ConnectionRegistry};
use super::router::{Delivery, InboundMessage, MessageRouter, Role};
use super::signaling::{ReconnectPolicy, SignalingClient, SignalingEvent};
use crate::config::Config;
use crate::identity::{IdentityAllocator, PeerCode};
use crate::protocol::AppMessage;
use crate::transport::{ChannelEvent, Transport, TransportError};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_GREET_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignalingStatus {
    Connecting,
    Ready,
    Disconnected,
    Reconnecting { attempt: u32 },
    Failed,
}

/// Snapshot of everything a host renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacadeState {
    /// Set once the broker accepted our code.
    pub local_id: Option<PeerCode>,
    pub is_registered: bool,
    pub signaling: SignalingStatus,
    pub last_error: Option<ConnectionError>,
    pub open_sessions: Vec<PeerCode>,
}

impl FacadeState {
    fn connecting() -> Self {
        Self {
            local_id: None,
            is_registered: false,
            signaling: SignalingStatus::Connecting,
            last_error: None,
            open_sessions: Vec::new(),
        }
    }
}

/// Receives every inbound message from every session.
#[async_trait]
pub trait PeerMessageHandler: Send + Sync {
    async fn on_message(&self, inbound: InboundMessage, sender: &MessageSender);
}

enum Command {
    Connect {
        remote: PeerCode,
        reply: oneshot::Sender<Result<ChannelState, ConnectionError>>,
    },
    Send {
        message: AppMessage,
        target: Option<PeerCode>,
        reply: oneshot::Sender<Result<Delivery, ConnectionError>>,
    },
    Disconnect {
        remote: PeerCode,
        reply: oneshot::Sender<bool>,
    },
    ReportError(ConnectionError),
    ClearError,
    Shutdown {
        done: Option<oneshot::Sender<()>>,
    },
}

enum Internal {
    Channel {
        generation: Generation,
        event: ChannelEvent,
    },
    DialTimeout(Generation),
    GreetDue(Generation),
}

fn closed_error() -> ConnectionError {
    ConnectionError::local("The session is closed.")
}

/// One host's stream of inbound messages.
///
/// Once the facade is disposed nothing more is yielded, including messages
/// that were buffered but not yet read.
pub struct Subscription {
    inbound: broadcast::Receiver<InboundMessage>,
    disposed: Arc<AtomicBool>,
}

impl Subscription {
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub async fn recv(&mut self) -> Result<InboundMessage, RecvError> {
        if self.is_disposed() {
            return Err(RecvError::Closed);
        }
        let message = self.inbound.recv().await?;
        if self.is_disposed() {
            return Err(RecvError::Closed);
        }
        Ok(message)
    }

    pub fn try_recv(&mut self) -> Result<InboundMessage, TryRecvError> {
        if self.is_disposed() {
            return Err(TryRecvError::Closed);
        }
        self.inbound.try_recv()
    }
}

/// Cloneable handle for sending application messages, handed to
/// [`PeerMessageHandler`]s so they can answer.
#[derive(Clone)]
pub struct MessageSender {
    commands: mpsc::UnboundedSender<Command>,
}

impl MessageSender {
    /// Send to `target`, or broadcast to every open session.
    pub async fn send(
        &self,
        message: AppMessage,
        target: Option<PeerCode>,
    ) -> Result<Delivery, ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send {
                message,
                target,
                reply,
            })
            .map_err(|_| closed_error())?;
        response.await.map_err(|_| closed_error())?
    }
}

pub struct FacadeBuilder {
    role: Role,
    transport: Arc<dyn Transport>,
    identity: Option<PeerCode>,
    dial_timeout: Duration,
    greet_delay: Duration,
    reconnect: ReconnectPolicy,
    inbound_capacity: usize,
}

impl FacadeBuilder {
    /// Use a fixed code instead of generating one.
    pub fn identity(mut self, code: PeerCode) -> Self {
        self.identity = Some(code);
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn greet_delay(mut self, delay: Duration) -> Self {
        self.greet_delay = delay;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    pub fn with_config(self, config: &Config) -> Self {
        self.dial_timeout(config.dial_timeout)
            .greet_delay(config.greet_delay)
            .reconnect_policy(config.reconnect)
    }

    /// Start signaling and spawn the actor. Must run inside a tokio runtime.
    pub fn build(self) -> Result<ConnectionFacade, ConnectionError> {
        let identity = self
            .identity
            .unwrap_or_else(|| IdentityAllocator.generate());
        let mut signaling = SignalingClient::new(self.transport, self.reconnect);
        let signaling_events = signaling.start(&identity)?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(FacadeState::connecting());
        let (inbound_tx, _) = broadcast::channel(self.inbound_capacity);

        info!(
            target = "stohb::session",
            local = %identity,
            role = ?self.role,
            "starting session"
        );
        let actor = Actor {
            registry: ConnectionRegistry::new(),
            signaling,
            router: MessageRouter::new(self.role),
            dial_timeout: self.dial_timeout,
            greet_delay: self.greet_delay,
            internal: internal_tx,
            inbound: inbound_tx.clone(),
            state: state_tx,
            local_id: None,
            is_registered: false,
            status: SignalingStatus::Connecting,
        };
        let task = tokio::spawn(actor.run(commands_rx, signaling_events, internal_rx));

        Ok(ConnectionFacade {
            role: self.role,
            identity,
            commands: commands_tx,
            state: state_rx,
            inbound: Mutex::new(Some(inbound_tx)),
            disposed: Arc::new(AtomicBool::new(false)),
            handlers: Mutex::new(Vec::new()),
            actor: Mutex::new(Some(task)),
        })
    }
}

pub struct ConnectionFacade {
    role: Role,
    identity: PeerCode,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<FacadeState>,
    inbound: Mutex<Option<broadcast::Sender<InboundMessage>>>,
    disposed: Arc<AtomicBool>,
    handlers: Mutex<Vec<AbortHandle>>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionFacade {
    pub fn builder(role: Role, transport: Arc<dyn Transport>) -> FacadeBuilder {
        FacadeBuilder {
            role,
            transport,
            identity: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            greet_delay: DEFAULT_GREET_DELAY,
            reconnect: ReconnectPolicy::default(),
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The code this facade registers with. Known before registration
    /// completes, unlike [`ConnectionFacade::local_id`].
    pub fn identity(&self) -> &PeerCode {
        &self.identity
    }

    pub fn local_id(&self) -> Option<PeerCode> {
        self.state.borrow().local_id.clone()
    }

    pub fn is_registered(&self) -> bool {
        self.state.borrow().is_registered
    }

    pub fn last_error(&self) -> Option<ConnectionError> {
        self.state.borrow().last_error.clone()
    }

    pub fn open_sessions(&self) -> Vec<PeerCode> {
        self.state.borrow().open_sessions.clone()
    }

    pub fn state(&self) -> FacadeState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<FacadeState> {
        self.state.clone()
    }

    /// Wait until the published state satisfies `predicate`. Returns `None`
    /// if the facade shuts down first.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Option<FacadeState>
    where
        F: FnMut(&FacadeState) -> bool,
    {
        let mut rx = self.state.clone();
        loop {
            {
                let state = rx.borrow_and_update();
                if predicate(&*state) {
                    return Some((*state).clone());
                }
            }
            if rx.changed().await.is_err() {
                let state = rx.borrow();
                return predicate(&*state).then(|| (*state).clone());
            }
        }
    }

    /// Connect to a code typed by the user. Invalid input is reported through
    /// [`ConnectionFacade::last_error`] as well as the return value.
    pub async fn connect(&self, code: &str) -> Result<ChannelState, ConnectionError> {
        match PeerCode::parse(code) {
            Ok(remote) => self.connect_to(remote).await,
            Err(err) => {
                let err = ConnectionError::local(format!("Invalid code: {err}"));
                let _ = self.commands.send(Command::ReportError(err.clone()));
                Err(err)
            }
        }
    }

    /// Start a channel to `remote`, or return the state of the one that
    /// already exists. Completion is observed through
    /// [`ConnectionFacade::open_sessions`] and [`ConnectionFacade::last_error`].
    pub async fn connect_to(&self, remote: PeerCode) -> Result<ChannelState, ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Connect { remote, reply })
            .map_err(|_| closed_error())?;
        response.await.map_err(|_| closed_error())?
    }

    /// Send to `target`, or broadcast when `target` is `None`. A target
    /// without an open session is a logged no-op reported as
    /// [`Delivery::NoSession`].
    pub async fn send(
        &self,
        message: AppMessage,
        target: Option<PeerCode>,
    ) -> Result<Delivery, ConnectionError> {
        self.sender().send(message, target).await
    }

    pub fn sender(&self) -> MessageSender {
        MessageSender {
            commands: self.commands.clone(),
        }
    }

    /// Close the session with one remote, pending or open. The remote sees
    /// the channel close; either side may connect again afterwards. Returns
    /// whether there was a session to close.
    pub async fn disconnect(&self, remote: &PeerCode) -> Result<bool, ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Disconnect {
                remote: remote.clone(),
                reply,
            })
            .map_err(|_| closed_error())?;
        response.await.map_err(|_| closed_error())
    }

    pub fn clear_error(&self) {
        let _ = self.commands.send(Command::ClearError);
    }

    /// Register for inbound messages. Dropping the receiver unregisters.
    pub fn subscribe(&self) -> Subscription {
        let inbound = match self.inbound.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        };
        Subscription {
            inbound,
            disposed: Arc::clone(&self.disposed),
        }
    }

    /// Drive `handler` with every inbound message until the facade is
    /// disposed.
    pub fn spawn_handler(&self, handler: Arc<dyn PeerMessageHandler>) -> JoinHandle<()> {
        let mut inbound = self.subscribe();
        let sender = self.sender();
        let task = tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(message) => handler.on_message(message, &sender).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target = "stohb::session", skipped, "handler lagged behind inbound messages");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.handlers.lock().push(task.abort_handle());
        task
    }

    /// Close every session, release the registration and stop all
    /// handlers. Safe to call more than once.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let (done, finished) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { done: Some(done) })
            .is_ok()
        {
            let _ = finished.await;
        }
        let actor = self.actor.lock().take();
        if let Some(actor) = actor {
            if let Err(err) = actor.await {
                if err.is_panic() {
                    warn!(target = "stohb::session", "session actor panicked");
                }
            }
        }
        self.inbound.lock().take();
        for handler in self.handlers.lock().drain(..) {
            handler.abort();
        }
        debug!(target = "stohb::session", local = %self.identity, "session disposed");
    }
}

impl Drop for ConnectionFacade {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Command::Shutdown { done: None });
        for handler in self.handlers.lock().drain(..) {
            handler.abort();
        }
    }
}

struct Actor {
    registry: ConnectionRegistry,
    signaling: SignalingClient,
    router: MessageRouter,
    dial_timeout: Duration,
    greet_delay: Duration,
    internal: mpsc::UnboundedSender<Internal>,
    inbound: broadcast::Sender<InboundMessage>,
    state: watch::Sender<FacadeState>,
    local_id: Option<PeerCode>,
    is_registered: bool,
    status: SignalingStatus,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.shutdown();
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = signaling_events.recv() => self.handle_signaling(event),
                Some(event) = internal.recv() => self.handle_internal(event),
            }
            self.publish();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { remote, reply } => {
                let result = self.connect(&remote);
                let _ = reply.send(result);
            }
            Command::Send {
                message,
                target,
                reply,
            } => {
                let result = self
                    .router
                    .send(&self.registry, &message, target.as_ref())
                    .map_err(|err| ConnectionError::local(err.to_string()));
                let _ = reply.send(result);
            }
            Command::Disconnect { remote, reply } => {
                let _ = reply.send(self.registry.close_remote(&remote));
            }
            Command::ReportError(err) => self.registry.set_error(err),
            Command::ClearError => self.registry.clear_error(),
            Command::Shutdown { .. } => {}
        }
    }

    fn connect(&mut self, remote: &PeerCode) -> Result<ChannelState, ConnectionError> {
        match self.registry.connect(self.signaling.transport(), remote) {
            ConnectOutcome::Existing { state, .. } => Ok(state),
            ConnectOutcome::Dialed { generation, events } => {
                self.pump(generation, events);
                self.arm_dial_timer(generation);
                Ok(ChannelState::Pending)
            }
            ConnectOutcome::Failed(err) => Err(err),
        }
    }

    fn pump(&mut self, generation: Generation, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let internal = self.internal.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let last = matches!(event, ChannelEvent::Close);
                if internal.send(Internal::Channel { generation, event }).is_err() || last {
                    break;
                }
            }
        });
        match self.registry.get_mut(generation) {
            Some(channel) => channel.attach(task.abort_handle()),
            None => task.abort(),
        }
    }

    fn arm_dial_timer(&mut self, generation: Generation) {
        let internal = self.internal.clone();
        let timeout = self.dial_timeout;
        let timer = tokio::spawn(async move {
            sleep(timeout).await;
            let _ = internal.send(Internal::DialTimeout(generation));
        });
        match self.registry.get_mut(generation) {
            Some(channel) => channel.set_timer(timer.abort_handle()),
            None => timer.abort(),
        }
    }

    fn schedule_greet(&mut self, generation: Generation) {
        let internal = self.internal.clone();
        let delay = self.greet_delay;
        let task = tokio::spawn(async move {
            sleep(delay).await;
            let _ = internal.send(Internal::GreetDue(generation));
        });
        match self.registry.get_mut(generation) {
            Some(channel) => channel.attach(task.abort_handle()),
            None => task.abort(),
        }
    }

    fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Ready(code) => {
                self.local_id = Some(code);
                self.is_registered = true;
                self.status = SignalingStatus::Ready;
            }
            SignalingEvent::Reconnected(_) => {
                self.is_registered = true;
                self.status = SignalingStatus::Ready;
            }
            SignalingEvent::Disconnected => {
                self.is_registered = false;
                self.status = SignalingStatus::Disconnected;
            }
            SignalingEvent::Reconnecting { attempt, .. } => {
                self.status = SignalingStatus::Reconnecting { attempt };
            }
            SignalingEvent::Failed { attempts } => {
                self.status = SignalingStatus::Failed;
                self.registry.set_error(ConnectionError::new(
                    ConnectionErrorKind::TransportError,
                    format!("Lost the pairing service after {attempts} attempts."),
                ));
            }
            SignalingEvent::TransportError(err) => {
                if matches!(err, TransportError::IdTaken(_)) {
                    self.status = SignalingStatus::Failed;
                    self.is_registered = false;
                }
                self.registry.set_error(err.into());
            }
            SignalingEvent::Incoming(raw) => match self.registry.on_incoming(raw) {
                Admission::Accepted { generation, events } => self.pump(generation, events),
                Admission::Rejected => {}
            },
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Channel { generation, event } => match event {
                ChannelEvent::Open => {
                    if let Some(opened) = self.registry.on_open(generation) {
                        if self.router.greets(opened.direction) {
                            self.schedule_greet(generation);
                        }
                    }
                }
                ChannelEvent::Data(text) => {
                    let Some(remote) = self.registry.on_data(generation).cloned() else {
                        return;
                    };
                    if let Some(inbound) = self.router.decode(&remote, &text) {
                        if self.inbound.send(inbound).is_err() {
                            debug!(target = "stohb::session", remote = %remote, "no inbound subscribers");
                        }
                    }
                }
                ChannelEvent::Close => {
                    self.registry.on_close(generation);
                }
                ChannelEvent::Error(err) => self.registry.on_error(generation, err),
            },
            Internal::DialTimeout(generation) => {
                self.registry.on_timeout(generation);
            }
            Internal::GreetDue(generation) => {
                let Some(remote) = self
                    .registry
                    .get(generation)
                    .filter(|channel| channel.is_open())
                    .map(|channel| channel.remote().clone())
                else {
                    return;
                };
                debug!(target = "stohb::session", remote = %remote, "sending greet");
                if let Err(err) = self
                    .router
                    .send(&self.registry, &AppMessage::Greet, Some(&remote))
                {
                    warn!(target = "stohb::session", error = %err, "greet not sent");
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.registry.close_all();
        self.signaling.stop();
        self.is_registered = false;
        self.status = SignalingStatus::Disconnected;
        self.publish();
        info!(target = "stohb::session", "session closed");
    }

    fn publish(&self) {
        let next = FacadeState {
            local_id: self.local_id.clone(),
            is_registered: self.is_registered,
            signaling: self.status,
            last_error: self.registry.last_error().cloned(),
            open_sessions: self.registry.open_sessions(),
        };
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
