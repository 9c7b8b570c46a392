//! Local clipboard change monitor
//!
//! Polls the provider's change counter every 100 ms and emits an item
//! whenever the clipboard content actually changed. Content that merely
//! re-triggers the counter with identical bytes is filtered by checksum,
//! which is also how the engine suppresses the echo of a remote item it
//! just applied.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{ClipboardItem, ClipboardProvider};

/// How often the change counter is sampled
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct MonitorState {
    last_change_count: Option<u64>,
    last_checksum: Option<String>,
    running: bool,
}

/// Watches the host clipboard for changes using polling
pub struct Monitor {
    provider: Arc<dyn ClipboardProvider>,
    interval: Duration,
    state: Mutex<MonitorState>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl Monitor {
    /// Create a monitor over the given provider
    pub fn new(provider: Arc<dyn ClipboardProvider>) -> Self {
        Self::with_interval(provider, POLL_INTERVAL)
    }

    /// Create a monitor with a custom poll interval
    pub fn with_interval(provider: Arc<dyn ClipboardProvider>, interval: Duration) -> Self {
        Self {
            provider,
            interval,
            state: Mutex::new(MonitorState {
                last_change_count: None,
                last_checksum: None,
                running: false,
            }),
            stop_tx: Mutex::new(None),
        }
    }

    /// Start polling. Captured items arrive on the returned channel until
    /// `stop` is called.
    pub fn start(self: &Arc<Self>) -> mpsc::Receiver<ClipboardItem> {
        let (tx, rx) = mpsc::channel(16);
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return rx;
            }
            state.running = true;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.run(tx, stop_rx).await;
        });
        rx
    }

    /// Stop polling
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return;
        }
        state.running = false;
        drop(state);

        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(true);
        }
    }

    /// True while the polling task is active
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Prime the last-seen checksum so an item the engine just applied is
    /// not re-captured as a local change
    pub fn set_last_checksum(&self, checksum: &str) {
        self.state.lock().unwrap().last_checksum = Some(checksum.to_string());
    }

    async fn run(&self, tx: mpsc::Sender<ClipboardItem>, mut stop_rx: watch::Receiver<bool>) {
        // Prime the counter so existing clipboard content does not fire
        // a change event at startup
        let initial = self.provider.change_count().await;
        self.state.lock().unwrap().last_change_count = Some(initial);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_for_changes(&tx).await;
                }
                _ = stop_rx.changed() => return,
            }
        }
    }

    async fn check_for_changes(&self, tx: &mpsc::Sender<ClipboardItem>) {
        let count = self.provider.change_count().await;
        {
            let mut state = self.state.lock().unwrap();
            if state.last_change_count == Some(count) {
                return;
            }
            state.last_change_count = Some(count);
        }

        // Transient entries (password managers) never enter the engine,
        // and their payloads are never logged
        if self.provider.has_transient().await {
            return;
        }

        let item = match self.provider.read().await {
            Ok(Some(item)) => item,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to read clipboard");
                return;
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            if state.last_checksum.as_deref() == Some(item.checksum.as_str()) {
                return;
            }
            state.last_checksum = Some(item.checksum.clone());
        }

        debug!(kind = %item.kind.label(), size = item.size, "local clipboard changed");
        let _ = tx.send(item).await;
    }
}
