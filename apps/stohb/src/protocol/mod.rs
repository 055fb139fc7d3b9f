pub mod app;
pub mod signaling;

pub use app::{
    ActiveCell, AppMessage, CellAssignment, CellRef, ImagePayload, PROTOCOL_VERSION,
    ProtocolError,
};
