//! Remote change watcher with adaptive polling
//!
//! The watcher polls the backend rather than relying on filesystem event
//! primitives, because the common deployment is a network mount or a
//! cloud-mirrored folder where such events are missing or delayed. The
//! poll interval adapts to clipboard activity: fast while items are
//! flowing, decaying to a slow idle rate when quiet.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::clipboard::ClipboardItem;

/// Poll interval during active use
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll interval when idle
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How recently activity must have occurred to count as "active"
pub const ACTIVITY_WINDOW: Duration = Duration::from_secs(30);

struct WatcherState {
    last_mod_time: Option<DateTime<Utc>>,
    last_checksum: Option<String>,
    last_activity: Option<Instant>,
    current_interval: Duration,
    running: bool,
}

/// Polls the backend for foreign changes and delivers decoded items
pub struct Watcher {
    backend: Arc<dyn Backend>,
    state: Mutex<WatcherState>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl Watcher {
    /// Create a watcher over the given backend handle
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: Mutex::new(WatcherState {
                last_mod_time: None,
                last_checksum: None,
                last_activity: None,
                current_interval: MAX_POLL_INTERVAL,
                running: false,
            }),
            stop_tx: Mutex::new(None),
        }
    }

    /// Start polling. Remote items arrive on the returned channel until
    /// `stop` is called.
    pub fn start(self: &Arc<Self>) -> mpsc::Receiver<ClipboardItem> {
        let (tx, rx) = mpsc::channel(16);
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return rx;
            }
            state.running = true;
            state.current_interval = MAX_POLL_INTERVAL;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            watcher.run(tx, stop_rx).await;
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

    /// Record clipboard activity; polling speeds up and decays back when
    /// things go quiet
    pub fn notify_activity(&self) {
        self.state.lock().unwrap().last_activity = Some(Instant::now());
    }

    /// Prime the last-seen checksum so a just-applied item is not
    /// re-delivered on the next tick
    pub fn set_last_checksum(&self, checksum: &str) {
        self.state.lock().unwrap().last_checksum = Some(checksum.to_string());
    }

    /// The interval currently in effect
    pub fn current_interval(&self) -> Duration {
        self.state.lock().unwrap().current_interval
    }

    /// Interval for a given idle duration: MIN inside the activity
    /// window, MAX past two windows, linear in between
    pub fn adaptive_interval(idle: Duration) -> Duration {
        if idle < ACTIVITY_WINDOW {
            return MIN_POLL_INTERVAL;
        }
        let past_window = idle - ACTIVITY_WINDOW;
        if past_window >= ACTIVITY_WINDOW {
            return MAX_POLL_INTERVAL;
        }
        let ratio = past_window.as_secs_f64() / ACTIVITY_WINDOW.as_secs_f64();
        let span = (MAX_POLL_INTERVAL - MIN_POLL_INTERVAL).as_secs_f64();
        MIN_POLL_INTERVAL + Duration::from_secs_f64(ratio * span)
    }

    fn recompute_interval(&self) -> Duration {
        let mut state = self.state.lock().unwrap();
        let idle = state
            .last_activity
            .map(|at| at.elapsed())
            .unwrap_or(ACTIVITY_WINDOW * 2);
        state.current_interval = Self::adaptive_interval(idle);
        state.current_interval
    }

    async fn run(&self, tx: mpsc::Sender<ClipboardItem>, mut stop_rx: watch::Receiver<bool>) {
        // Initial probe so a pre-existing artifact is picked up promptly
        self.check_for_changes(&tx).await;

        loop {
            let interval = self.recompute_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.check_for_changes(&tx).await;
                }
                _ = stop_rx.changed() => return,
            }
        }
    }

    async fn check_for_changes(&self, tx: &mpsc::Sender<ClipboardItem>) {
        if self.backend.location().is_empty() {
            return;
        }

        // Cheap probe first; absent artifact or transient error just
        // skips this tick
        let mod_time = match self.backend.mod_time().await {
            Ok(mod_time) => mod_time,
            Err(_) => return,
        };

        {
            let mut state = self.state.lock().unwrap();
            if let Some(last) = state.last_mod_time {
                if mod_time <= last {
                    return;
                }
            }
            state.last_mod_time = Some(mod_time);
        }

        let item = match self.backend.read().await {
            Ok(Some(item)) => item,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to read remote clipboard");
                return;
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            if state.last_checksum.as_deref() == Some(item.checksum.as_str()) {
                // Timestamp moved but content is stable
                return;
            }
            state.last_checksum = Some(item.checksum.clone());
        }

        debug!(source = %item.source_machine, "remote clipboard changed");
        let _ = tx.send(item).await;
    }
}
