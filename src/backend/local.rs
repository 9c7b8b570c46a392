//! Shared-folder backend
//!
//! Persists the artifact in a hidden directory under a folder that is
//! visible on every participating machine (network mount, cloud-mirrored
//! folder). Writes are serialized across processes with an advisory lock
//! file; the artifact itself is committed with a temp-file-plus-rename so
//! readers never observe a partial write.

use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Backend, BackendError, BackendKind};
use crate::artifact;
use crate::clipboard::ClipboardItem;

/// Hidden directory created under the shared folder
pub const DIR_NAME: &str = ".clipshare";

/// Artifact file name
pub const CURRENT_FILE: &str = "current.clip";

/// Lock file name
pub const LOCK_FILE: &str = "current.clip.lock";

/// How long a lock stays valid
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(unix)]
const FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// Lock file contents
#[derive(Debug, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            holder: crate::clipboard::hostname(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_TIMEOUT.as_secs() as i64),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    fn is_ours(&self) -> bool {
        self.holder == crate::clipboard::hostname() && self.pid == std::process::id()
    }
}

/// Backend over a shared filesystem folder
pub struct LocalBackend {
    base_path: Mutex<PathBuf>,
}

impl LocalBackend {
    /// Create a backend with no location configured
    pub fn new() -> Self {
        Self {
            base_path: Mutex::new(PathBuf::new()),
        }
    }

    /// Create a backend rooted at the given shared folder
    pub fn with_path(base: impl Into<PathBuf>) -> Self {
        Self {
            base_path: Mutex::new(base.into()),
        }
    }

    fn base(&self) -> PathBuf {
        self.base_path.lock().unwrap().clone()
    }

    fn sync_dir(&self) -> PathBuf {
        self.base().join(DIR_NAME)
    }

    fn clip_path(&self) -> PathBuf {
        self.sync_dir().join(CURRENT_FILE)
    }

    fn temp_path(&self) -> PathBuf {
        self.sync_dir().join(format!("{CURRENT_FILE}.tmp"))
    }

    fn lock_path(&self) -> PathBuf {
        self.sync_dir().join(LOCK_FILE)
    }

    async fn write_lock_file(&self, record: &LockRecord, exclusive: bool) -> std::io::Result<()> {
        let data = serde_json::to_vec(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if exclusive {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }
        #[cfg(unix)]
        options.mode(FILE_MODE);
        let mut file = options.open(self.lock_path()).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Acquire the write lock. Exclusive-create first; on collision the
    /// existing lock is refreshed if ours, broken if expired or corrupt
    /// (one retry, never more), else the call fails with `Locked`.
    async fn acquire_lock(&self) -> Result<(), BackendError> {
        let record = LockRecord::new();

        match self.write_lock_file(&record, true).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let existing = match tokio::fs::read(self.lock_path()).await {
            Ok(data) => serde_json::from_slice::<LockRecord>(&data).ok(),
            Err(_) => None,
        };

        match existing {
            Some(lock) if lock.is_ours() => {
                // Refresh our own expiry
                self.write_lock_file(&record, false).await?;
                Ok(())
            }
            Some(lock) if !lock.is_expired() => Err(BackendError::Locked),
            Some(_) | None => {
                // Expired, corrupt, or unreadable: break it and retry once
                let _ = tokio::fs::remove_file(self.lock_path()).await;
                match self.write_lock_file(&record, true).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        Err(BackendError::Locked)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn release_lock(&self) {
        let _ = tokio::fs::remove_file(self.lock_path()).await;
    }

    /// Remove an expired lock left behind by a crashed writer
    async fn clean_stale_locks(&self) {
        let data = match tokio::fs::read(self.lock_path()).await {
            Ok(data) => data,
            Err(_) => return,
        };
        let lock: LockRecord = match serde_json::from_slice(&data) {
            Ok(lock) => lock,
            Err(_) => return,
        };
        if lock.is_expired() {
            debug!(holder = %lock.holder, pid = lock.pid, "removing stale lock");
            let _ = tokio::fs::remove_file(self.lock_path()).await;
        }
    }

    async fn write_artifact(&self, item: &ClipboardItem) -> Result<(), BackendError> {
        let data = artifact::encode(item)?;

        let temp_path = self.temp_path();
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(FILE_MODE);
        {
            let mut file = options.open(&temp_path).await?;
            file.write_all(&data).await?;
            file.flush().await?;
        }

        // The rename is the commit point; atomic on POSIX filesystems
        if let Err(e) = tokio::fs::rename(&temp_path, self.clip_path()).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<(), BackendError> {
        let base = self.base();
        if base.as_os_str().is_empty() {
            return Err(BackendError::NotConfigured);
        }
        if !tokio::fs::try_exists(&base).await.unwrap_or(false) {
            return Err(BackendError::InvalidLocation(format!(
                "location does not exist: {}",
                base.display()
            )));
        }

        let sync_dir = self.sync_dir();
        tokio::fs::create_dir_all(&sync_dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(DIR_MODE);
            tokio::fs::set_permissions(&sync_dir, perms).await?;
        }

        self.clean_stale_locks().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn write(&self, item: &ClipboardItem) -> Result<(), BackendError> {
        if self.base().as_os_str().is_empty() {
            return Err(BackendError::NotConfigured);
        }
        self.init().await?;

        self.acquire_lock().await?;
        let result = self.write_artifact(item).await;
        self.release_lock().await;
        result
    }

    async fn read(&self) -> Result<Option<ClipboardItem>, BackendError> {
        if self.base().as_os_str().is_empty() {
            return Err(BackendError::NotConfigured);
        }

        let data = match tokio::fs::read(self.clip_path()).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(artifact::decode(&data)?))
    }

    async fn mod_time(&self) -> Result<DateTime<Utc>, BackendError> {
        let meta = tokio::fs::metadata(self.clip_path())
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackendError::NotFound,
                _ => BackendError::Io(e),
            })?;
        let modified = meta.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }

    // A bare filesystem has no cheap digest, so this decodes the full
    // artifact and returns the item checksum.
    async fn checksum(&self) -> Result<String, BackendError> {
        match self.read().await? {
            Some(item) => Ok(item.checksum),
            None => Err(BackendError::NotFound),
        }
    }

    async fn exists(&self) -> bool {
        tokio::fs::try_exists(self.clip_path()).await.unwrap_or(false)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn location(&self) -> String {
        self.base().to_string_lossy().to_string()
    }

    fn set_location(&self, location: &str) -> Result<(), BackendError> {
        if location.is_empty() {
            *self.base_path.lock().unwrap() = PathBuf::new();
            return Ok(());
        }

        let path = Path::new(location);
        if !path.is_absolute() {
            return Err(BackendError::InvalidLocation(format!(
                "path must be absolute: {location}"
            )));
        }
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(BackendError::InvalidLocation(format!(
                "path must not traverse upward: {location}"
            )));
        }

        *self.base_path.lock().unwrap() = path.to_path_buf();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend_in(dir: &TempDir) -> LocalBackend {
        let backend = LocalBackend::new();
        backend
            .set_location(dir.path().to_str().unwrap())
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir);
        backend.init().await.unwrap();

        let item = ClipboardItem::text("shared text");
        backend.write(&item).await.unwrap();

        let loaded = backend.read().await.unwrap().unwrap();
        assert_eq!(loaded, item);
        assert!(backend.exists().await);
        assert_eq!(backend.checksum().await.unwrap(), item.checksum);
    }

    #[tokio::test]
    async fn read_absent_artifact_returns_none() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir);
        backend.init().await.unwrap();

        assert!(backend.read().await.unwrap().is_none());
        assert!(!backend.exists().await);
        assert!(matches!(
            backend.mod_time().await,
            Err(BackendError::NotFound)
        ));
    }

    #[tokio::test]
    async fn unconfigured_backend_refuses_operations() {
        let backend = LocalBackend::new();
        assert!(matches!(
            backend.init().await,
            Err(BackendError::NotConfigured)
        ));
        assert!(matches!(
            backend.write(&ClipboardItem::text("x")).await,
            Err(BackendError::NotConfigured)
        ));
        assert!(matches!(
            backend.read().await,
            Err(BackendError::NotConfigured)
        ));
    }

    #[test]
    fn set_location_validates_path() {
        let backend = LocalBackend::new();
        assert!(backend.set_location("relative/path").is_err());
        assert!(backend.set_location("/tmp/../etc").is_err());
        assert!(backend.set_location("/tmp/shared").is_ok());
        assert_eq!(backend.location(), "/tmp/shared");
        assert!(backend.set_location("").is_ok());
        assert_eq!(backend.location(), "");
    }

    #[tokio::test]
    async fn held_lock_blocks_second_writer() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir);
        backend.init().await.unwrap();

        // Simulate another process holding a fresh lock
        let foreign = LockRecord {
            holder: "other-host".to_string(),
            pid: 1,
            acquired_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(10),
        };
        tokio::fs::write(
            backend.lock_path(),
            serde_json::to_vec(&foreign).unwrap(),
        )
        .await
        .unwrap();

        let err = backend.write(&ClipboardItem::text("x")).await.unwrap_err();
        assert!(matches!(err, BackendError::Locked));
        // Artifact must not have been written
        assert!(!backend.exists().await);
    }

    #[tokio::test]
    async fn expired_lock_is_broken_and_write_succeeds() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir);
        backend.init().await.unwrap();

        let stale = LockRecord {
            holder: "other-host".to_string(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::seconds(60),
            expires_at: Utc::now() - chrono::Duration::seconds(50),
        };
        tokio::fs::write(backend.lock_path(), serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();

        backend.write(&ClipboardItem::text("fresh")).await.unwrap();
        let loaded = backend.read().await.unwrap().unwrap();
        assert_eq!(loaded.as_text().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn corrupt_lock_is_removed_and_write_succeeds() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir);
        backend.init().await.unwrap();

        tokio::fs::write(backend.lock_path(), b"not json at all")
            .await
            .unwrap();

        backend.write(&ClipboardItem::text("ok")).await.unwrap();
        assert!(backend.exists().await);
    }

    #[tokio::test]
    async fn init_cleans_stale_lock() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir);
        backend.init().await.unwrap();

        let stale = LockRecord {
            holder: "gone".to_string(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::seconds(60),
            expires_at: Utc::now() - chrono::Duration::seconds(50),
        };
        tokio::fs::write(backend.lock_path(), serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();

        backend.init().await.unwrap();
        assert!(!tokio::fs::try_exists(backend.lock_path())
            .await
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn lock_released_after_write() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir);
        backend.init().await.unwrap();

        backend.write(&ClipboardItem::text("a")).await.unwrap();
        assert!(!tokio::fs::try_exists(backend.lock_path())
            .await
            .unwrap_or(true));
        // Lock gone, so a second write from the same process succeeds
        backend.write(&ClipboardItem::text("b")).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_writers_one_wins_one_locked() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().to_str().unwrap().to_string();

        // Two distinct backend instances on the same folder; one grabs the
        // lock first by holding a foreign lock record for the other.
        let winner = LocalBackend::new();
        winner.set_location(&base).unwrap();
        winner.init().await.unwrap();

        let loser = LocalBackend::new();
        loser.set_location(&base).unwrap();

        winner.acquire_lock().await.unwrap();
        // Rewrite the lock as a different process so the loser cannot
        // treat it as its own (both instances share this pid).
        let foreign = LockRecord {
            holder: "peer-host".to_string(),
            pid: std::process::id().wrapping_add(1),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(10),
        };
        tokio::fs::write(winner.lock_path(), serde_json::to_vec(&foreign).unwrap())
            .await
            .unwrap();

        let item = ClipboardItem::text("winner payload");
        let write_result = winner.write_artifact(&item).await;
        let contended = loser.write(&ClipboardItem::text("loser payload")).await;
        winner.release_lock().await;

        assert!(write_result.is_ok());
        assert!(matches!(contended, Err(BackendError::Locked)));

        let stored = winner.read().await.unwrap().unwrap();
        assert_eq!(stored.as_text().as_deref(), Some("winner payload"));
        assert_eq!(stored.checksum, item.checksum);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn artifact_and_dir_permissions_are_restricted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir);
        backend.init().await.unwrap();
        backend.write(&ClipboardItem::text("perm")).await.unwrap();

        let dir_mode = tokio::fs::metadata(backend.sync_dir())
            .await
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let file_mode = tokio::fs::metadata(backend.clip_path())
            .await
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
