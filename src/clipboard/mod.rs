//! Clipboard item model and host-clipboard abstraction
//!
//! This module defines the in-memory value that transits the sync system,
//! the provider trait the engine uses to talk to the host OS clipboard,
//! and the polling monitor that turns clipboard activity into change
//! events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod monitor;
pub mod system;

pub use monitor::Monitor;
pub use system::SystemClipboard;

/// Kind of clipboard content carried by an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// UTF-8 text
    Text,
    /// PNG image
    Image,
}

impl ItemKind {
    /// Parse a kind from its wire label
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "text" => Some(ItemKind::Text),
            "image" => Some(ItemKind::Image),
            _ => None,
        }
    }

    /// The wire label for this kind
    pub fn label(&self) -> &'static str {
        match self {
            ItemKind::Text => "text",
            ItemKind::Image => "image",
        }
    }
}

/// A clipboard item with metadata
///
/// Invariants established at construction: `size` equals the payload
/// length and `checksum` is the lowercase hex SHA-256 of the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipboardItem {
    /// Unique token per emission (UUID v4, textual form)
    pub id: String,
    /// UTC instant of capture, millisecond precision
    pub timestamp: DateTime<Utc>,
    /// Hostname of the originating machine
    pub source_machine: String,
    /// User on the originating machine
    pub source_user: String,
    /// Content kind
    pub kind: ItemKind,
    /// Descriptive media type ("text/plain", "image/png")
    pub media_type: String,
    /// Lowercase hex SHA-256 of `payload`
    pub checksum: String,
    /// Byte length of `payload`
    pub size: u64,
    /// Raw content bytes
    pub payload: Vec<u8>,
}

impl ClipboardItem {
    /// Create a text item captured now on this host
    pub fn text(text: impl Into<String>) -> Self {
        Self::from_payload(text.into().into_bytes(), ItemKind::Text, "text/plain")
    }

    /// Create an image item (PNG bytes) captured now on this host
    pub fn image(png: Vec<u8>) -> Self {
        Self::from_payload(png, ItemKind::Image, "image/png")
    }

    fn from_payload(payload: Vec<u8>, kind: ItemKind, media_type: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: capture_instant(),
            source_machine: hostname(),
            source_user: username(),
            kind,
            media_type: media_type.to_string(),
            checksum: payload_checksum(&payload),
            size: payload.len() as u64,
            payload,
        }
    }

    /// True if the item carries text
    pub fn is_text(&self) -> bool {
        self.kind == ItemKind::Text
    }

    /// True if the item carries an image
    pub fn is_image(&self) -> bool {
        self.kind == ItemKind::Image
    }

    /// The payload as a string, for text items
    pub fn as_text(&self) -> Option<String> {
        if self.is_text() {
            String::from_utf8(self.payload.clone()).ok()
        } else {
            None
        }
    }
}

/// Lowercase hex SHA-256 of a payload
pub fn payload_checksum(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

// Capture instants carry millisecond precision, matching what the
// artifact format can represent
fn capture_instant() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Hostname of this machine
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

/// Login user on this machine
pub fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

/// Clipboard errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Image data could not be encoded or decoded
    #[error("Image conversion failed: {0}")]
    Image(String),

    /// No content available
    #[error("No clipboard content available")]
    NoContent,
}

/// Host-clipboard provider
///
/// The engine serializes access; implementations only need to tolerate one
/// caller at a time per method.
#[async_trait]
pub trait ClipboardProvider: Send + Sync {
    /// A monotonically non-decreasing counter that changes iff the OS
    /// clipboard has changed. Need not be contiguous.
    async fn change_count(&self) -> u64;

    /// True if the OS clipboard is flagged as transient/concealed
    /// (password managers). Such entries are never published.
    async fn has_transient(&self) -> bool;

    /// Read the current clipboard as an item, preferring image over text
    /// when both are present. Returns `None` when the clipboard is empty,
    /// unreadable, or transient.
    async fn read(&self) -> Result<Option<ClipboardItem>, ClipboardError>;

    /// Install an item into the OS clipboard. Returns false on failure.
    async fn write(&self, item: &ClipboardItem) -> bool;

    /// Provider name for diagnostics
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_item_invariants() {
        let item = ClipboardItem::text("Hello");
        assert_eq!(item.kind, ItemKind::Text);
        assert_eq!(item.media_type, "text/plain");
        assert_eq!(item.size, 5);
        assert_eq!(item.size as usize, item.payload.len());
        assert_eq!(
            item.checksum,
            "185f8db32271fe25f561a6fc938b2e264306ec304eda518007d1764826381969"
        );
        assert_eq!(item.as_text().as_deref(), Some("Hello"));
    }

    #[test]
    fn image_item_invariants() {
        let data = vec![0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];
        let item = ClipboardItem::image(data.clone());
        assert_eq!(item.kind, ItemKind::Image);
        assert_eq!(item.media_type, "image/png");
        assert_eq!(item.size as usize, data.len());
        assert_eq!(item.checksum, payload_checksum(&data));
        assert!(item.as_text().is_none());
    }

    #[test]
    fn ids_are_unique_per_emission() {
        let a = ClipboardItem::text("x");
        let b = ClipboardItem::text("x");
        assert_ne!(a.id, b.id);
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn kind_labels_round_trip() {
        assert_eq!(ItemKind::from_label("text"), Some(ItemKind::Text));
        assert_eq!(ItemKind::from_label("image"), Some(ItemKind::Image));
        assert_eq!(ItemKind::from_label("file"), None);
        assert_eq!(ItemKind::Text.label(), "text");
        assert_eq!(ItemKind::Image.label(), "image");
    }
}
