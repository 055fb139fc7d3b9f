//! Host-side policy for the photo column of a sheet.
//!
//! The session layer moves messages; these hosts decide what they mean. A
//! [`ProviderHost`] answers greetings with an assignment for the selected
//! cell and stores incoming photos, and a [`ReceiverHost`] remembers which
//! cell it was handed.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::identity::PeerCode;
use crate::protocol::{AppMessage, CellAssignment, CellRef};
use crate::session::{InboundMessage, MessageSender, PeerMessageHandler};

pub const MAX_IMAGES_PER_CELL: usize = 4;
/// Only cells in this column hold photos.
pub const IMAGE_COLUMN: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cell {row},{col} already holds {MAX_IMAGES_PER_CELL} images", row = .0.row, col = .0.col)]
pub struct CellFull(pub CellRef);

#[derive(Debug, Default)]
pub struct PhotoSheet {
    cells: HashMap<CellRef, Vec<String>>,
}

impl PhotoSheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cell: CellRef, image: String) -> Result<usize, CellFull> {
        let images = self.cells.entry(cell).or_default();
        if images.len() >= MAX_IMAGES_PER_CELL {
            return Err(CellFull(cell));
        }
        images.push(image);
        Ok(images.len())
    }

    pub fn count(&self, cell: CellRef) -> usize {
        self.cells.get(&cell).map_or(0, Vec::len)
    }

    pub fn images(&self, cell: CellRef) -> &[String] {
        self.cells.get(&cell).map_or(&[], Vec::as_slice)
    }

    /// Filled cells, ordered by row then column.
    pub fn cells(&self) -> Vec<(CellRef, usize)> {
        let mut cells: Vec<_> = self
            .cells
            .iter()
            .filter(|(_, images)| !images.is_empty())
            .map(|(cell, images)| (*cell, images.len()))
            .collect();
        cells.sort_by_key(|(cell, _)| (cell.row, cell.col));
        cells
    }
}

#[derive(Debug, Default)]
pub struct ProviderHost {
    selected: Mutex<Option<CellRef>>,
    sheet: Mutex<PhotoSheet>,
}

impl ProviderHost {
    pub fn new(selected: Option<CellRef>) -> Self {
        Self {
            selected: Mutex::new(selected),
            sheet: Mutex::new(PhotoSheet::new()),
        }
    }

    pub fn select(&self, cell: Option<CellRef>) {
        *self.selected.lock() = cell;
    }

    /// Assignment to hand a device that just greeted us, if the selection is
    /// a photo cell.
    pub fn assignment(&self) -> Option<AppMessage> {
        let cell = (*self.selected.lock())?;
        if cell.col != IMAGE_COLUMN {
            return None;
        }
        let count = self.sheet.lock().count(cell) as u32;
        Some(AppMessage::assign(cell, count))
    }

    pub fn image_count(&self, cell: CellRef) -> usize {
        self.sheet.lock().count(cell)
    }

    pub fn images(&self, cell: CellRef) -> Vec<String> {
        self.sheet.lock().images(cell).to_vec()
    }

    pub fn filled_cells(&self) -> Vec<(CellRef, usize)> {
        self.sheet.lock().cells()
    }
}

#[async_trait]
impl PeerMessageHandler for ProviderHost {
    async fn on_message(&self, inbound: InboundMessage, sender: &MessageSender) {
        let InboundMessage { from, message } = inbound;
        match message {
            AppMessage::Greet => {
                let Some(assignment) = self.assignment() else {
                    info!(target = "stohb::sheet", remote = %from, "greeted with no photo cell selected");
                    return;
                };
                if let Err(err) = sender.send(assignment, Some(from.clone())).await {
                    warn!(target = "stohb::sheet", remote = %from, error = %err, "assignment not sent");
                }
            }
            AppMessage::ImageData(payload) => {
                let cell = payload.cell();
                let stored = self.sheet.lock().add(cell, payload.image);
                match stored {
                    Ok(count) => info!(
                        target = "stohb::sheet",
                        remote = %from,
                        row = cell.row,
                        col = cell.col,
                        count,
                        "stored image"
                    ),
                    Err(err) => warn!(target = "stohb::sheet", remote = %from, "{err}"),
                }
            }
            other => debug!(target = "stohb::sheet", remote = %from, kind = other.kind(), "ignored"),
        }
    }
}

pub struct ReceiverHost {
    assignment: watch::Sender<Option<(PeerCode, CellAssignment)>>,
}

impl Default for ReceiverHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverHost {
    pub fn new() -> Self {
        Self {
            assignment: watch::channel(None).0,
        }
    }

    pub fn assignment(&self) -> Option<(PeerCode, CellAssignment)> {
        self.assignment.borrow().clone()
    }

    /// Wait for the first assignment.
    pub async fn wait_for_assignment(&self) -> (PeerCode, CellAssignment) {
        let mut rx = self.assignment.subscribe();
        loop {
            if let Some(assignment) = rx.borrow_and_update().clone() {
                return assignment;
            }
            // The sender lives in self, so this never errors while we wait.
            let _ = rx.changed().await;
        }
    }

    /// How many more photos the assigned cell accepts.
    pub fn remaining(&self) -> usize {
        self.assignment()
            .map(|(_, assignment)| {
                MAX_IMAGES_PER_CELL.saturating_sub(assignment.current_count as usize)
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl PeerMessageHandler for ReceiverHost {
    async fn on_message(&self, inbound: InboundMessage, _sender: &MessageSender) {
        let assignment = match inbound.message {
            AppMessage::AssignCell(assignment) => assignment,
            AppMessage::SetActiveCell(active) => CellAssignment {
                row: active.row,
                col: active.col,
                current_count: active.current_count.unwrap_or(0),
            },
            other => {
                debug!(target = "stohb::sheet", remote = %inbound.from, kind = other.kind(), "ignored");
                return;
            }
        };
        info!(
            target = "stohb::sheet",
            remote = %inbound.from,
            row = assignment.row,
            col = assignment.col,
            "assigned cell"
        );
        self.assignment.send_replace(Some((inbound.from, assignment)));
    }
}

/// Read an image file into a `data:` URI.
pub async fn image_data_uri(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    };
    Ok(format!("data:{mime};base64,{}", STANDARD.encode(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_caps_images_per_cell() {
        let mut sheet = PhotoSheet::new();
        let cell = CellRef::new(2, 0);
        for n in 1..=MAX_IMAGES_PER_CELL {
            assert_eq!(sheet.add(cell, format!("img{n}")), Ok(n));
        }
        assert_eq!(sheet.add(cell, "extra".into()), Err(CellFull(cell)));
        assert_eq!(sheet.count(cell), MAX_IMAGES_PER_CELL);
        assert_eq!(sheet.images(cell)[0], "img1");
        assert_eq!(sheet.cells(), vec![(cell, MAX_IMAGES_PER_CELL)]);
    }

    #[test]
    fn provider_only_assigns_photo_column() {
        let provider = ProviderHost::new(Some(CellRef::new(3, 1)));
        assert!(provider.assignment().is_none());

        provider.select(Some(CellRef::new(3, 0)));
        assert_eq!(
            provider.assignment(),
            Some(AppMessage::assign(CellRef::new(3, 0), 0))
        );

        provider.select(None);
        assert!(provider.assignment().is_none());
    }

    #[test]
    fn assignment_reports_images_already_stored() {
        let provider = ProviderHost::new(Some(CellRef::new(1, 0)));
        provider
            .sheet
            .lock()
            .add(CellRef::new(1, 0), "data:image/png;base64,AA==".into())
            .unwrap();
        assert_eq!(
            provider.assignment(),
            Some(AppMessage::assign(CellRef::new(1, 0), 1))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn data_uri_uses_extension_mime() {
        let dir = std::env::temp_dir().join(format!("stohb-sheet-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("photo.PNG");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        let uri = image_data_uri(&path).await.unwrap();
        assert_eq!(uri, "data:image/png;base64,iVBORw==");
        assert_eq!(
            image_data_uri(&dir.join("missing.jpg")).await.unwrap_err().kind(),
            std::io::ErrorKind::NotFound
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
