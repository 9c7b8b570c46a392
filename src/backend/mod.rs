//! Storage backends for the shared clipboard artifact
//!
//! A backend persists the single artifact on some rendezvous medium and
//! exposes a uniform capability set: publish, retrieve, and cheap change
//! probes for the watcher. Three variants exist today (a shared folder,
//! an S3 bucket, and Dropbox) and the interface is open for more.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::clipboard::ClipboardItem;
use crate::config::Config;

pub mod dropbox;
pub mod local;
pub mod s3;

pub use dropbox::DropboxBackend;
pub use local::LocalBackend;
pub use s3::S3Backend;

/// Identifies a backend variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Shared filesystem folder
    Local,
    /// S3 object store
    S3,
    /// Dropbox hosted file service
    Dropbox,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::S3 => write!(f, "s3"),
            BackendKind::Dropbox => write!(f, "dropbox"),
        }
    }
}

/// Errors surfaced by any backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend has no usable location or credentials yet
    #[error("backend not configured")]
    NotConfigured,

    /// No artifact exists at the configured location
    #[error("clipboard artifact not found")]
    NotFound,

    /// Another process holds the write lock
    #[error("artifact is locked by another process")]
    Locked,

    /// A concurrent writer changed the artifact underneath us
    #[error("write conflict detected")]
    Conflict,

    /// Hosted service has no stored credentials for this machine
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    /// Location string rejected by the backend
    #[error("invalid location: {0}")]
    InvalidLocation(String),

    /// Stored artifact failed to decode
    #[error("decode failed: {0}")]
    Codec(#[from] ArtifactError),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Network or service error
    #[error("transport error: {0}")]
    Transport(String),
}

/// Uniform capability set over a rendezvous medium
///
/// Backends must tolerate one concurrent reader (the watcher) plus one
/// concurrent writer (the engine). In-flight operations are cancelled by
/// dropping their futures; callers that need a deadline wrap calls in
/// [`tokio::time::timeout`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create resources, authenticate, clean stale locks
    async fn init(&self) -> Result<(), BackendError>;

    /// Release client resources
    async fn close(&self) -> Result<(), BackendError>;

    /// Publish an item as the new shared artifact
    async fn write(&self, item: &ClipboardItem) -> Result<(), BackendError>;

    /// Retrieve and decode the shared artifact, `None` if absent
    async fn read(&self) -> Result<Option<ClipboardItem>, BackendError>;

    /// Last modification instant of the artifact
    async fn mod_time(&self) -> Result<DateTime<Utc>, BackendError>;

    /// Cheap content digest: the artifact checksum or a backend-native
    /// strong ETag. A change of this string means the content changed.
    async fn checksum(&self) -> Result<String, BackendError>;

    /// True if an artifact exists at the configured location
    async fn exists(&self) -> bool;

    /// The backend variant
    fn kind(&self) -> BackendKind;

    /// Human-readable location string, empty when unconfigured
    fn location(&self) -> String;

    /// Update the backend location/path
    fn set_location(&self, location: &str) -> Result<(), BackendError>;
}

/// Create a backend from configuration
pub fn create(config: &Config) -> Result<std::sync::Arc<dyn Backend>, BackendError> {
    match config.backend_type.as_str() {
        "local" | "" => {
            let backend = LocalBackend::new();
            if !config.location.is_empty() {
                backend.set_location(&config.location)?;
            }
            Ok(std::sync::Arc::new(backend))
        }
        "s3" => Ok(std::sync::Arc::new(S3Backend::new(
            &config.s3_bucket,
            &config.s3_prefix,
            &config.s3_region,
        ))),
        "dropbox" => Ok(std::sync::Arc::new(DropboxBackend::new(
            &config.dropbox_app_key,
            &config.dropbox_app_secret,
        ))),
        other => Err(BackendError::InvalidLocation(format!(
            "unknown backend type: {other}"
        ))),
    }
}
