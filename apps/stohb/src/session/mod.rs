pub mod channel;
pub mod error;
pub mod facade;
pub mod registry;
pub mod router;
pub mod signaling;

pub use channel::{ChannelState, Direction, Generation, SessionChannel};
pub use error::{ConnectionError, ConnectionErrorKind};
pub use facade::{
    ConnectionFacade, FacadeBuilder, FacadeState, MessageSender, PeerMessageHandler,
    SignalingStatus, Subscription,
};
pub use registry::{Admission, ConnectOutcome, ConnectionRegistry};
pub use router::{Delivery, InboundMessage, MessageRouter, Role};
pub use signaling::{ReconnectPolicy, SignalingClient, SignalingEvent};
