//! Application messages exchanged over a session channel.
//!
//! Wire shape is `{"type": KIND, "payload": {...}, "v": 1}`. GREET carries no
//! payload. Messages without `v` are read as the current version so older
//! clients that never sent one keep working.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 1;

/// A cell coordinate on the provider's grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCell {
    pub row: u32,
    pub col: u32,
    #[serde(
        rename = "currentCount",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub current_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellAssignment {
    pub row: u32,
    pub col: u32,
    /// Images already stored in the cell when the assignment was made.
    #[serde(rename = "currentCount", default)]
    pub current_count: u32,
}

impl CellAssignment {
    pub fn cell(&self) -> CellRef {
        CellRef::new(self.row, self.col)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub row: u32,
    pub col: u32,
    /// Image encoded as a `data:` URI, carried verbatim.
    pub image: String,
}

impl ImagePayload {
    pub fn cell(&self) -> CellRef {
        CellRef::new(self.row, self.col)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppMessage {
    Greet,
    SetActiveCell(ActiveCell),
    AssignCell(CellAssignment),
    ImageData(ImagePayload),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{kind} message is missing its payload")]
    MissingPayload { kind: &'static str },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Serialize)]
struct Outbound<'a> {
    #[serde(flatten)]
    message: &'a AppMessage,
    v: u32,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    v: Option<u32>,
}

impl AppMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            AppMessage::Greet => "GREET",
            AppMessage::SetActiveCell(_) => "SET_ACTIVE_CELL",
            AppMessage::AssignCell(_) => "ASSIGN_CELL",
            AppMessage::ImageData(_) => "IMAGE_DATA",
        }
    }

    pub fn assign(cell: CellRef, current_count: u32) -> Self {
        AppMessage::AssignCell(CellAssignment {
            row: cell.row,
            col: cell.col,
            current_count,
        })
    }

    pub fn image(cell: CellRef, data_uri: impl Into<String>) -> Self {
        AppMessage::ImageData(ImagePayload {
            row: cell.row,
            col: cell.col,
            image: data_uri.into(),
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&Outbound {
            message: self,
            v: PROTOCOL_VERSION,
        })?)
    }

    /// Decode one inbound message.
    ///
    /// `Ok(None)` means the text was well formed but carried a kind this
    /// build does not know; callers drop it.
    pub fn decode(text: &str) -> Result<Option<Self>, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let version = envelope.v.unwrap_or(PROTOCOL_VERSION);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let message = match envelope.kind.as_str() {
            "GREET" => AppMessage::Greet,
            "SET_ACTIVE_CELL" => AppMessage::SetActiveCell(payload(envelope.payload, "SET_ACTIVE_CELL")?),
            "ASSIGN_CELL" => AppMessage::AssignCell(payload(envelope.payload, "ASSIGN_CELL")?),
            "IMAGE_DATA" => AppMessage::ImageData(payload(envelope.payload, "IMAGE_DATA")?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

fn payload<T: serde::de::DeserializeOwned>(
    value: Option<Value>,
    kind: &'static str,
) -> Result<T, ProtocolError> {
    match value {
        Some(value) if !value.is_null() => Ok(serde_json::from_value(value)?),
        _ => Err(ProtocolError::MissingPayload { kind }),
    }
}
