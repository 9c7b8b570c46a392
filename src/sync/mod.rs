//! Clipboard synchronization engine
//!
//! The engine wires the clipboard monitor, the storage backend, and the
//! remote watcher together: local changes are published to the shared
//! artifact, remote changes are applied to the local clipboard, and a
//! last-writer-wins policy reconciles the two. Echo loops, where our own
//! applied item comes straight back as a "local change", are suppressed
//! at two levels, by checksum in the monitor and again here.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod watcher;

pub use watcher::Watcher;

use crate::backend::{Backend, BackendError};
use crate::clipboard::{ClipboardItem, ClipboardProvider, Monitor};

/// Upper bound on a single backend publish
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Observable engine status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Not running
    Idle,
    /// Running and healthy
    Syncing,
    /// Running but suspended by the user
    Paused,
    /// Running; the last publish failed
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "Idle"),
            SyncStatus::Syncing => write!(f, "Syncing"),
            SyncStatus::Paused => write!(f, "Paused"),
            SyncStatus::Error => write!(f, "Error"),
        }
    }
}

/// Handler invoked on every status change; calls are serial
pub type StatusHandler = Arc<dyn Fn(SyncStatus) + Send + Sync>;

/// Sync engine errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// Backend rejected an operation
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

struct EngineState {
    last_local_item: Option<ClipboardItem>,
    last_remote_item: Option<ClipboardItem>,
    last_applied_checksum: Option<String>,
    status: SyncStatus,
    last_error: Option<String>,
    last_sync_time: Option<DateTime<Utc>>,
    paused: bool,
    running: bool,
}

/// Coordinates clipboard synchronization against a shared backend
pub struct SyncEngine {
    backend: Arc<dyn Backend>,
    clipboard: Arc<dyn ClipboardProvider>,
    monitor: Arc<Monitor>,
    watcher: Arc<Watcher>,
    hostname: String,
    max_payload_size: u64,
    state: Mutex<EngineState>,
    status_handler: Mutex<Option<StatusHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Create an engine over a backend and a host clipboard provider
    pub fn new(backend: Arc<dyn Backend>, clipboard: Arc<dyn ClipboardProvider>) -> Self {
        Self::with_hostname(backend, clipboard, crate::clipboard::hostname())
    }

    /// Create an engine with an explicit host identity. Items whose
    /// `source_machine` equals this name are treated as our own writes
    /// reflected back.
    pub fn with_hostname(
        backend: Arc<dyn Backend>,
        clipboard: Arc<dyn ClipboardProvider>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            monitor: Arc::new(Monitor::new(Arc::clone(&clipboard))),
            watcher: Arc::new(Watcher::new(Arc::clone(&backend))),
            backend,
            clipboard,
            hostname: hostname.into(),
            max_payload_size: crate::artifact::MAX_PAYLOAD_SIZE,
            state: Mutex::new(EngineState {
                last_local_item: None,
                last_remote_item: None,
                last_applied_checksum: None,
                status: SyncStatus::Idle,
                last_error: None,
                last_sync_time: None,
                paused: false,
                running: false,
            }),
            status_handler: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Cap the size of published payloads (`max_payload_size` from the
    /// configuration; at most the artifact format's payload ceiling).
    /// Larger local items are skipped rather than published.
    pub fn with_max_payload_size(mut self, max_payload_size: u64) -> Self {
        self.max_payload_size = max_payload_size.min(crate::artifact::MAX_PAYLOAD_SIZE);
        self
    }

    /// Install the status change handler
    pub fn on_status_change(&self, handler: StatusHandler) {
        *self.status_handler.lock().unwrap() = Some(handler);
    }

    /// Start the clipboard monitor and, if a location is configured, the
    /// remote watcher
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return;
            }
            state.running = true;
            state.paused = false;
        }

        let local_rx = self.monitor.start();
        self.spawn_local_dispatch(local_rx);

        if !self.backend.location().is_empty() {
            let remote_rx = self.watcher.start();
            self.spawn_remote_dispatch(remote_rx);
        }

        info!("sync engine started");
        self.set_status(SyncStatus::Syncing);
    }

    /// Stop both pollers
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return;
            }
            state.running = false;
        }

        self.monitor.stop();
        self.watcher.stop();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        info!("sync engine stopped");
        self.set_status(SyncStatus::Idle);
    }

    /// Suspend synchronization without stopping the pollers
    pub fn pause(&self) {
        self.state.lock().unwrap().paused = true;
        self.set_status(SyncStatus::Paused);
    }

    /// Resume after a pause
    pub fn resume(&self) {
        self.state.lock().unwrap().paused = false;
        self.set_status(SyncStatus::Syncing);
    }

    /// Point the backend at a new location, re-initializing it and
    /// restarting the watcher if we are running
    pub async fn set_location(self: &Arc<Self>, path: &str) -> Result<(), SyncError> {
        let was_running = self.state.lock().unwrap().running;

        if was_running {
            self.watcher.stop();
        }

        self.backend.set_location(path)?;

        if !path.is_empty() {
            self.backend.init().await?;
        }

        if was_running && !path.is_empty() {
            let remote_rx = self.watcher.start();
            self.spawn_remote_dispatch(remote_rx);
        }

        info!(location = path, "shared location updated");
        Ok(())
    }

    /// Current location of the underlying backend
    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Current status
    pub fn status(&self) -> SyncStatus {
        self.state.lock().unwrap().status
    }

    /// True if paused
    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    /// True if running
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Message of the most recent publish failure, if any
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_error.clone()
    }

    /// Instant of the last successful publish or apply
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_sync_time
    }

    fn spawn_local_dispatch(self: &Arc<Self>, mut rx: mpsc::Receiver<ClipboardItem>) {
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                engine.handle_local_change(item).await;
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    fn spawn_remote_dispatch(self: &Arc<Self>, mut rx: mpsc::Receiver<ClipboardItem>) {
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                engine.handle_remote_change(item).await;
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    fn set_status(&self, status: SyncStatus) {
        self.state.lock().unwrap().status = status;
        // Clone the handler out so no lock is held during the call
        let handler = self.status_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(status);
        }
    }

    async fn handle_local_change(&self, item: ClipboardItem) {
        if item.size > self.max_payload_size {
            debug!(
                size = item.size,
                max = self.max_payload_size,
                "clipboard payload exceeds max_payload_size, skipping"
            );
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.paused || !state.running {
                return;
            }
            // Echo of an item we just applied from remote
            if state.last_applied_checksum.as_deref() == Some(item.checksum.as_str()) {
                debug!("dropping echo of applied remote item");
                return;
            }
            state.last_local_item = Some(item.clone());
        }

        info!(host = %self.hostname, kind = %item.kind.label(), "local clipboard changed, publishing");

        let result = match tokio::time::timeout(WRITE_TIMEOUT, self.backend.write(&item)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Transport("publish timed out".to_string())),
        };

        match result {
            Ok(()) => {
                let recovered = {
                    let mut state = self.state.lock().unwrap();
                    state.last_sync_time = Some(Utc::now());
                    state.last_error = None;
                    state.status == SyncStatus::Error
                };
                self.watcher.notify_activity();
                if recovered {
                    self.set_status(SyncStatus::Syncing);
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to publish clipboard");
                self.state.lock().unwrap().last_error = Some(e.to_string());
                self.set_status(SyncStatus::Error);
            }
        }
    }

    async fn handle_remote_change(&self, item: ClipboardItem) {
        {
            let mut state = self.state.lock().unwrap();
            if state.paused || !state.running {
                return;
            }
            // Our own write reflected back
            if item.source_machine == self.hostname {
                return;
            }
            // Already applied this emission
            if let Some(previous) = &state.last_remote_item {
                if previous.id == item.id {
                    return;
                }
            }
            // Last-writer-wins: only apply a strictly newer remote item
            if let Some(local) = &state.last_local_item {
                if item.timestamp <= local.timestamp {
                    debug!("remote item is not newer than local, dropping");
                    return;
                }
            }
            state.last_remote_item = Some(item.clone());
            state.last_applied_checksum = Some(item.checksum.clone());
        }

        info!(from = %item.source_machine, kind = %item.kind.label(), "applying remote clipboard");

        if !self.clipboard.write(&item).await {
            warn!("failed to apply remote clipboard");
            return;
        }

        // Prime both pollers so the apply does not echo back around
        self.monitor.set_last_checksum(&item.checksum);
        self.watcher.set_last_checksum(&item.checksum);

        self.state.lock().unwrap().last_sync_time = Some(Utc::now());
        self.watcher.notify_activity();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::backend::BackendKind;
    use crate::clipboard::{ClipboardError, ItemKind};

    /// Backend storing the artifact in memory, with failure injection
    struct MemoryBackend {
        stored: Mutex<Option<ClipboardItem>>,
        writes: Mutex<u32>,
        fail_next_write: Mutex<bool>,
    }

    impl MemoryBackend {
        fn new() -> Self {
            Self {
                stored: Mutex::new(None),
                writes: Mutex::new(0),
                fail_next_write: Mutex::new(false),
            }
        }

        fn write_count(&self) -> u32 {
            *self.writes.lock().unwrap()
        }

        fn stored_checksum(&self) -> Option<String> {
            self.stored.lock().unwrap().as_ref().map(|i| i.checksum.clone())
        }
    }

    #[async_trait]
    impl Backend for MemoryBackend {
        async fn init(&self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn write(&self, item: &ClipboardItem) -> Result<(), BackendError> {
            if std::mem::take(&mut *self.fail_next_write.lock().unwrap()) {
                return Err(BackendError::Locked);
            }
            *self.writes.lock().unwrap() += 1;
            *self.stored.lock().unwrap() = Some(item.clone());
            Ok(())
        }
        async fn read(&self) -> Result<Option<ClipboardItem>, BackendError> {
            Ok(self.stored.lock().unwrap().clone())
        }
        async fn mod_time(&self) -> Result<DateTime<Utc>, BackendError> {
            match self.stored.lock().unwrap().as_ref() {
                Some(item) => Ok(item.timestamp),
                None => Err(BackendError::NotFound),
            }
        }
        async fn checksum(&self) -> Result<String, BackendError> {
            self.stored_checksum().ok_or(BackendError::NotFound)
        }
        async fn exists(&self) -> bool {
            self.stored.lock().unwrap().is_some()
        }
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }
        fn location(&self) -> String {
            "memory://test".to_string()
        }
        fn set_location(&self, _location: &str) -> Result<(), BackendError> {
            Ok(())
        }
    }

    /// Scripted clipboard provider
    struct MockClipboard {
        content: Mutex<Option<(ItemKind, Vec<u8>)>>,
        count: Mutex<u64>,
    }

    impl MockClipboard {
        fn new() -> Self {
            Self {
                content: Mutex::new(None),
                count: Mutex::new(0),
            }
        }

        fn text(&self) -> Option<String> {
            self.content
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|(_, payload)| String::from_utf8(payload.clone()).ok())
        }
    }

    #[async_trait]
    impl ClipboardProvider for MockClipboard {
        async fn change_count(&self) -> u64 {
            *self.count.lock().unwrap()
        }
        async fn has_transient(&self) -> bool {
            false
        }
        async fn read(&self) -> Result<Option<ClipboardItem>, ClipboardError> {
            Ok(self.content.lock().unwrap().as_ref().map(|(kind, payload)| {
                match kind {
                    ItemKind::Text => {
                        ClipboardItem::text(String::from_utf8_lossy(payload).to_string())
                    }
                    ItemKind::Image => ClipboardItem::image(payload.clone()),
                }
            }))
        }
        async fn write(&self, item: &ClipboardItem) -> bool {
            *self.content.lock().unwrap() = Some((item.kind, item.payload.clone()));
            *self.count.lock().unwrap() += 1;
            true
        }
        fn name(&self) -> &str {
            "mock"
        }
    }

    fn remote_item(payload: &str, source: &str, at: DateTime<Utc>) -> ClipboardItem {
        let mut item = ClipboardItem::text(payload);
        item.source_machine = source.to_string();
        item.timestamp = at;
        item
    }

    fn engine_fixture() -> (Arc<SyncEngine>, Arc<MemoryBackend>, Arc<MockClipboard>) {
        let backend = Arc::new(MemoryBackend::new());
        let clipboard = Arc::new(MockClipboard::new());
        let engine = Arc::new(SyncEngine::new(
            backend.clone() as Arc<dyn Backend>,
            clipboard.clone() as Arc<dyn ClipboardProvider>,
        ));
        (engine, backend, clipboard)
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn local_change_publishes_to_backend() {
        let (engine, backend, _clipboard) = engine_fixture();
        engine.start();

        let item = ClipboardItem::text("published");
        engine.handle_local_change(item.clone()).await;

        assert_eq!(backend.write_count(), 1);
        assert_eq!(backend.stored_checksum().as_deref(), Some(item.checksum.as_str()));
        assert!(engine.last_sync_time().is_some());
        engine.stop();
    }

    #[tokio::test]
    async fn oversized_local_items_are_not_published() {
        let backend = Arc::new(MemoryBackend::new());
        let clipboard = Arc::new(MockClipboard::new());
        let engine = Arc::new(
            SyncEngine::new(
                backend.clone() as Arc<dyn Backend>,
                clipboard.clone() as Arc<dyn ClipboardProvider>,
            )
            .with_max_payload_size(16),
        );
        engine.start();

        engine
            .handle_local_change(ClipboardItem::text("well over the sixteen byte cap"))
            .await;
        assert_eq!(backend.write_count(), 0);

        // Items at or under the cap still publish
        engine.handle_local_change(ClipboardItem::text("short")).await;
        assert_eq!(backend.write_count(), 1);
        engine.stop();
    }

    #[tokio::test]
    async fn remote_item_is_applied_to_clipboard() {
        let (engine, _backend, clipboard) = engine_fixture();
        engine.start();

        let remote = remote_item("from h2", "h2", base_time());
        engine.handle_remote_change(remote.clone()).await;

        assert_eq!(clipboard.text().as_deref(), Some("from h2"));
        let state = engine.state.lock().unwrap();
        assert_eq!(
            state.last_applied_checksum.as_deref(),
            Some(remote.checksum.as_str())
        );
        drop(state);
        engine.stop();
    }

    #[tokio::test]
    async fn applied_remote_item_does_not_echo_back() {
        let (engine, backend, _clipboard) = engine_fixture();
        engine.start();

        let remote = remote_item("echo me", "h2", base_time());
        engine.handle_remote_change(remote.clone()).await;

        // The OS clipboard change event for our own apply comes back as a
        // local change with the same checksum: it must not republish
        let echo = ClipboardItem::text("echo me");
        assert_eq!(echo.checksum, remote.checksum);
        engine.handle_local_change(echo).await;
        assert_eq!(backend.write_count(), 0);

        // A genuinely different item still publishes
        engine.handle_local_change(ClipboardItem::text("new content")).await;
        assert_eq!(backend.write_count(), 1);
        engine.stop();
    }

    #[tokio::test]
    async fn own_machine_items_are_dropped() {
        let (engine, _backend, clipboard) = engine_fixture();
        engine.start();

        let own = remote_item("looped back", &engine.hostname, base_time());
        engine.handle_remote_change(own).await;
        assert!(clipboard.text().is_none());
        engine.stop();
    }

    #[tokio::test]
    async fn duplicate_remote_ids_apply_once() {
        let (engine, _backend, clipboard) = engine_fixture();
        engine.start();

        let remote = remote_item("v1", "h2", base_time());
        engine.handle_remote_change(remote.clone()).await;
        assert_eq!(clipboard.text().as_deref(), Some("v1"));

        // Same emission re-delivered (e.g. mod-time moved without content
        // change); must not re-apply
        let mut replay = remote.clone();
        replay.payload = b"v2".to_vec();
        replay.timestamp = base_time() + chrono::Duration::seconds(5);
        engine.handle_remote_change(replay).await;
        assert_eq!(clipboard.text().as_deref(), Some("v1"));
        engine.stop();
    }

    #[tokio::test]
    async fn last_writer_wins_drops_older_remote() {
        let (engine, _backend, clipboard) = engine_fixture();
        engine.start();

        let mut local = ClipboardItem::text("local newer");
        local.timestamp = base_time() + chrono::Duration::milliseconds(1);
        engine.handle_local_change(local).await;

        // Remote captured before (and exactly at) our local write loses
        let older = remote_item("remote older", "h2", base_time());
        engine.handle_remote_change(older).await;
        assert!(clipboard.text().is_none());

        let tied = remote_item(
            "remote tied",
            "h2",
            base_time() + chrono::Duration::milliseconds(1),
        );
        engine.handle_remote_change(tied).await;
        assert!(clipboard.text().is_none());

        // Strictly newer remote wins
        let newer = remote_item(
            "remote newer",
            "h2",
            base_time() + chrono::Duration::milliseconds(2),
        );
        engine.handle_remote_change(newer).await;
        assert_eq!(clipboard.text().as_deref(), Some("remote newer"));
        engine.stop();
    }

    #[tokio::test]
    async fn last_writer_wins_any_delivery_order() {
        let a = remote_item("A", "h2", base_time());
        let b = remote_item("B", "h3", base_time() + chrono::Duration::milliseconds(1));

        for order in [[a.clone(), b.clone()], [b.clone(), a.clone()]] {
            let (engine, _backend, clipboard) = engine_fixture();
            engine.start();
            for item in order {
                engine.handle_remote_change(item).await;
            }
            assert_eq!(clipboard.text().as_deref(), Some("B"));
            engine.stop();
        }
    }

    #[tokio::test]
    async fn paused_engine_drops_both_directions() {
        let (engine, backend, clipboard) = engine_fixture();
        engine.start();
        engine.pause();

        engine.handle_local_change(ClipboardItem::text("local")).await;
        engine
            .handle_remote_change(remote_item("remote", "h2", base_time()))
            .await;

        assert_eq!(backend.write_count(), 0);
        assert!(clipboard.text().is_none());

        engine.resume();
        engine.handle_local_change(ClipboardItem::text("local")).await;
        assert_eq!(backend.write_count(), 1);
        engine.stop();
    }

    #[tokio::test]
    async fn status_follows_lifecycle_and_write_errors() {
        let (engine, backend, _clipboard) = engine_fixture();

        let seen: Arc<Mutex<Vec<SyncStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.on_status_change(Arc::new(move |status| {
            sink.lock().unwrap().push(status);
        }));

        assert_eq!(engine.status(), SyncStatus::Idle);
        engine.start();
        assert_eq!(engine.status(), SyncStatus::Syncing);

        engine.pause();
        assert_eq!(engine.status(), SyncStatus::Paused);
        engine.resume();
        assert_eq!(engine.status(), SyncStatus::Syncing);

        // A failing publish degrades to Error without stopping the engine
        *backend.fail_next_write.lock().unwrap() = true;
        engine.handle_local_change(ClipboardItem::text("will fail")).await;
        assert_eq!(engine.status(), SyncStatus::Error);
        assert!(engine.last_error().is_some());
        assert!(engine.is_running());

        // The next successful publish clears the error
        engine.handle_local_change(ClipboardItem::text("recovers")).await;
        assert_eq!(engine.status(), SyncStatus::Syncing);
        assert!(engine.last_error().is_none());

        engine.stop();
        assert_eq!(engine.status(), SyncStatus::Idle);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SyncStatus::Syncing,
                SyncStatus::Paused,
                SyncStatus::Syncing,
                SyncStatus::Error,
                SyncStatus::Syncing,
                SyncStatus::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn stopped_engine_ignores_events() {
        let (engine, backend, _clipboard) = engine_fixture();
        engine.handle_local_change(ClipboardItem::text("before start")).await;
        assert_eq!(backend.write_count(), 0);
    }
}
