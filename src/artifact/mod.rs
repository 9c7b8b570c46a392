//! Binary artifact codec for the on-medium clipboard file
//!
//! A single self-describing format carries one clipboard item across the
//! rendezvous medium:
//!
//! ```text
//! offset  size  field
//!   0      4    magic = ASCII "YCLP"
//!   4      4    version (u32, big-endian), currently 1
//!   8      4    header length (u32, big-endian), at most 1 MiB
//!  12      H    header: UTF-8 JSON object
//!  12+H    N    payload bytes, N = header.size, at most 100 MiB
//! ```
//!
//! The JSON header tolerates additive fields for forward compatibility;
//! the length bounds keep a crafted header or payload from exhausting
//! memory.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clipboard::{payload_checksum, ClipboardItem, ItemKind};

/// Magic bytes identifying a clipshare artifact
pub const MAGIC: &[u8; 4] = b"YCLP";

/// Current artifact format version
pub const CURRENT_VERSION: u32 = 1;

/// Maximum header size (1 MiB)
pub const MAX_HEADER_SIZE: u32 = 1024 * 1024;

/// Maximum payload size (100 MiB)
pub const MAX_PAYLOAD_SIZE: u64 = 100 * 1024 * 1024;

/// Timestamp format written by the encoder
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// Artifact codec errors, one variant per failure kind
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Magic bytes do not match "YCLP"
    #[error("invalid magic bytes")]
    InvalidMagic,

    /// Version newer than this implementation understands
    #[error("unsupported artifact version {0}")]
    UnsupportedVersion(u32),

    /// Declared header length exceeds the 1 MiB bound
    #[error("header size {0} exceeds maximum")]
    HeaderTooLarge(u32),

    /// Declared payload size exceeds the 100 MiB bound
    #[error("payload size {0} exceeds maximum")]
    PayloadTooLarge(u64),

    /// Header is not a well-formed JSON object of the expected shape
    #[error("invalid header format")]
    InvalidHeader,

    /// Input ends before the declared header or payload
    #[error("truncated artifact")]
    Truncated,

    /// SHA-256 of the payload does not match the header checksum
    #[error("checksum verification failed")]
    ChecksumMismatch,

    /// Header timestamp matches none of the accepted formats
    #[error("unable to parse timestamp: {0}")]
    InvalidTimestamp(String),

    /// Header content_type is neither "text" nor "image"
    #[error("unknown content type: {0}")]
    UnknownContentType(String),
}

/// JSON metadata written between the fixed prefix and the payload
#[derive(Debug, Serialize, Deserialize)]
struct ArtifactHeader {
    id: String,
    timestamp: String,
    source_machine: String,
    source_user: String,
    content_type: String,
    mime_type: String,
    checksum: String,
    size: u64,
}

/// Serialize a clipboard item to the artifact format
pub fn encode(item: &ClipboardItem) -> Result<Vec<u8>, ArtifactError> {
    if item.size > MAX_PAYLOAD_SIZE {
        return Err(ArtifactError::PayloadTooLarge(item.size));
    }

    let header = ArtifactHeader {
        id: item.id.clone(),
        timestamp: item.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        source_machine: item.source_machine.clone(),
        source_user: item.source_user.clone(),
        content_type: item.kind.label().to_string(),
        mime_type: item.media_type.clone(),
        checksum: item.checksum.clone(),
        size: item.size,
    };

    let header_bytes = serde_json::to_vec(&header).map_err(|_| ArtifactError::InvalidHeader)?;

    let mut buf = Vec::with_capacity(12 + header_bytes.len() + item.payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&CURRENT_VERSION.to_be_bytes());
    buf.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(&item.payload);

    Ok(buf)
}

/// Deserialize an artifact back into a clipboard item
pub fn decode(data: &[u8]) -> Result<ClipboardItem, ArtifactError> {
    if data.len() >= 4 && &data[..4] != MAGIC {
        return Err(ArtifactError::InvalidMagic);
    }
    if data.len() < 12 {
        return Err(ArtifactError::Truncated);
    }

    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version > CURRENT_VERSION {
        return Err(ArtifactError::UnsupportedVersion(version));
    }

    let header_len = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    if header_len > MAX_HEADER_SIZE {
        return Err(ArtifactError::HeaderTooLarge(header_len));
    }

    let header_end = 12usize + header_len as usize;
    if data.len() < header_end {
        return Err(ArtifactError::Truncated);
    }

    let header: ArtifactHeader = serde_json::from_slice(&data[12..header_end])
        .map_err(|_| ArtifactError::InvalidHeader)?;

    if header.size > MAX_PAYLOAD_SIZE {
        return Err(ArtifactError::PayloadTooLarge(header.size));
    }

    let payload_end = header_end + header.size as usize;
    if data.len() < payload_end {
        return Err(ArtifactError::Truncated);
    }
    let payload = data[header_end..payload_end].to_vec();

    if payload_checksum(&payload) != header.checksum {
        return Err(ArtifactError::ChecksumMismatch);
    }

    let timestamp = parse_timestamp(&header.timestamp)?;
    let kind = ItemKind::from_label(&header.content_type)
        .ok_or_else(|| ArtifactError::UnknownContentType(header.content_type.clone()))?;

    Ok(ClipboardItem {
        id: header.id,
        timestamp,
        source_machine: header.source_machine,
        source_user: header.source_user,
        kind,
        media_type: header.mime_type,
        checksum: header.checksum,
        size: header.size,
        payload,
    })
}

/// Parse a header timestamp, accepting the four emitted variants:
/// millisecond fraction or not, numeric offset or 'Z'.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ArtifactError> {
    const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.3f%:z", "%Y-%m-%dT%H:%M:%S%:z"];
    const ZULU_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.3fZ", "%Y-%m-%dT%H:%M:%SZ"];

    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for format in ZULU_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt.and_utc());
        }
    }
    Err(ArtifactError::InvalidTimestamp(s.to_string()))
}
