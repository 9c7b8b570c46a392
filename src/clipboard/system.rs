//! System clipboard provider backed by `arboard`
//!
//! `arboard` exposes no OS change counter, so this provider derives one:
//! each `change_count` call samples the clipboard, hashes what it sees,
//! and bumps an internal counter when the hash differs from the previous
//! sample. The counter is monotone and moves iff the content moved, which
//! is all the monitor requires. Transient/concealed markers are not
//! visible through `arboard`, so `has_transient` is always false here.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use image::codecs::png::PngEncoder;
use image::ImageEncoder;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::{ClipboardError, ClipboardItem, ClipboardProvider};

/// Cross-platform system clipboard
pub struct SystemClipboard {
    counter: AtomicU64,
    last_sample: Mutex<Option<String>>,
}

impl SystemClipboard {
    /// Create a provider for the host clipboard
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            last_sample: Mutex::new(None),
        }
    }

    // Hash of whatever the clipboard currently holds, image preferred.
    // Raw RGBA bytes are hashed for images; PNG encoding only happens on
    // an actual read.
    fn sample_hash() -> Option<String> {
        let mut clipboard = arboard::Clipboard::new().ok()?;

        if let Ok(img) = clipboard.get_image() {
            let mut hasher = Sha256::new();
            hasher.update(b"image");
            hasher.update(img.width.to_le_bytes());
            hasher.update(img.height.to_le_bytes());
            hasher.update(&img.bytes);
            return Some(hex::encode(hasher.finalize()));
        }

        let text = clipboard.get_text().ok().filter(|t| !t.is_empty())?;
        let mut hasher = Sha256::new();
        hasher.update(b"text");
        hasher.update(text.as_bytes());
        Some(hex::encode(hasher.finalize()))
    }
}

impl Default for SystemClipboard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClipboardProvider for SystemClipboard {
    async fn change_count(&self) -> u64 {
        let sample = Self::sample_hash();
        let mut last = self.last_sample.lock().unwrap();
        if *last != sample {
            *last = sample;
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
        self.counter.load(Ordering::SeqCst)
    }

    async fn has_transient(&self) -> bool {
        false
    }

    async fn read(&self) -> Result<Option<ClipboardItem>, ClipboardError> {
        let mut clipboard = arboard::Clipboard::new()
            .map_err(|e| ClipboardError::Platform(e.to_string()))?;

        // Image wins when both formats are present
        if let Ok(img) = clipboard.get_image() {
            let png = png_from_rgba(&img.bytes, img.width as u32, img.height as u32)?;
            return Ok(Some(ClipboardItem::image(png)));
        }

        match clipboard.get_text() {
            Ok(text) if !text.is_empty() => Ok(Some(ClipboardItem::text(text))),
            Ok(_) => Ok(None),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(ClipboardError::Platform(e.to_string())),
        }
    }

    async fn write(&self, item: &ClipboardItem) -> bool {
        let mut clipboard = match arboard::Clipboard::new() {
            Ok(clipboard) => clipboard,
            Err(e) => {
                warn!(error = %e, "failed to open clipboard");
                return false;
            }
        };

        let result = if item.is_image() {
            match rgba_from_png(&item.payload) {
                Ok((bytes, width, height)) => clipboard.set_image(arboard::ImageData {
                    width: width as usize,
                    height: height as usize,
                    bytes: Cow::Owned(bytes),
                }),
                Err(e) => {
                    warn!(error = %e, "remote image payload is not valid PNG");
                    return false;
                }
            }
        } else {
            match item.as_text() {
                Some(text) => clipboard.set_text(text),
                None => return false,
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to write clipboard");
                false
            }
        }
    }

    fn name(&self) -> &str {
        "system"
    }
}

/// Encode raw RGBA pixels as PNG
fn png_from_rgba(rgba: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ClipboardError> {
    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(rgba, width, height, image::ExtendedColorType::Rgba8)
        .map_err(|e| ClipboardError::Image(e.to_string()))?;
    Ok(png)
}

/// Decode a PNG payload into raw RGBA pixels
fn rgba_from_png(png: &[u8]) -> Result<(Vec<u8>, u32, u32), ClipboardError> {
    let decoded = image::load_from_memory_with_format(png, image::ImageFormat::Png)
        .map_err(|e| ClipboardError::Image(e.to_string()))?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok((rgba.into_raw(), width, height))
}
