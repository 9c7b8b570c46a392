//! # Clipshare
//!
//! Clipboard synchronization across machines through a shared rendezvous
//! object: a single binary artifact stored on a shared folder, an S3
//! bucket, or Dropbox. Each machine publishes its local clipboard to the
//! artifact and watches it for changes made by other machines.
//!
//! The crate is organized around four pieces:
//!
//! - [`artifact`]: the on-medium binary format (magic, version, JSON
//!   header, payload, checksum).
//! - [`backend`]: pluggable storage backends with a uniform capability set.
//! - [`clipboard`]: the clipboard item model, the host-clipboard provider
//!   trait, and the local change monitor.
//! - [`sync`]: the engine that reconciles local and remote changes under a
//!   last-writer-wins policy, and the adaptive remote watcher.

pub mod artifact;
pub mod backend;
pub mod cli;
pub mod clipboard;
pub mod config;
pub mod sync;

pub use config::Config;

/// Result type alias for clipshare operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for clipshare operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Artifact codec error
    #[error("Artifact error: {0}")]
    Artifact(#[from] artifact::ArtifactError),

    /// Storage backend error
    #[error("Backend error: {0}")]
    Backend(#[from] backend::BackendError),

    /// Clipboard operation error
    #[error("Clipboard error: {0}")]
    Clipboard(#[from] clipboard::ClipboardError),

    /// Sync engine error
    #[error("Sync error: {0}")]
    Sync(#[from] sync::SyncError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
