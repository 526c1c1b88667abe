//! Idle Monitor (§4.8).
//!
//! Resets on every inbound message, outbound message, workspace filesystem
//! change, or subprocess activity, and emits at most one nudge per idle
//! window once the configured threshold elapses while the current task is
//! `in-progress`.
//!
//! Grounded on `openai-codex`'s `FileSystemWatcher`, simplified: this engine
//! only needs "was there any change at all", not per-file tracking, so
//! there is no debouncer and no per-path watch list — a single recursive
//! `notify` watcher over the workspace root feeds one `last_activity` clock.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, Notify};
use tracing::warn;

pub const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 600;

struct Inner {
    last_activity: Mutex<Instant>,
    activity_notify: Notify,
    nudged_this_window: AtomicBool,
}

/// Shared handle: clone freely, all clones observe the same clock.
#[derive(Clone)]
pub struct IdleMonitor {
    inner: Arc<Inner>,
    threshold: Duration,
    _watcher: Option<Arc<RecommendedWatcher>>,
}

impl IdleMonitor {
    /// `threshold_secs == 0` disables idle nudging entirely (the monitor
    /// still tracks activity but `check` never reports a nudge).
    pub fn new(workspace_root: &Path, threshold_secs: u64) -> Self {
        let inner = Arc::new(Inner {
            last_activity: Mutex::new(Instant::now()),
            activity_notify: Notify::new(),
            nudged_this_window: AtomicBool::new(false),
        });

        let watch_inner = inner.clone();
        let watcher_result = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                watch_inner.nudged_this_window.store(false, Ordering::SeqCst);
                if let Ok(mut guard) = watch_inner.last_activity.try_lock() {
                    *guard = Instant::now();
                }
                watch_inner.activity_notify.notify_waiters();
            }
        });

        let watcher = match watcher_result {
            Ok(mut watcher) => match watcher.watch(workspace_root, RecursiveMode::Recursive) {
                Ok(()) => Some(Arc::new(watcher)),
                Err(err) => {
                    warn!(error = %err, path = %workspace_root.display(), "failed to watch workspace root for idle detection");
                    None
                }
            },
            Err(err) => {
                warn!(error = %err, "failed to construct filesystem watcher");
                None
            }
        };

        Self {
            inner,
            threshold: Duration::from_secs(threshold_secs),
            _watcher: watcher,
        }
    }

    /// Records non-filesystem activity: an inbound/outbound chat message or
    /// subprocess output.
    pub async fn record_activity(&self) {
        *self.inner.last_activity.lock().await = Instant::now();
        self.inner.nudged_this_window.store(false, Ordering::SeqCst);
        self.inner.activity_notify.notify_waiters();
    }

    pub async fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().await.elapsed()
    }

    /// Returns `true` at most once per idle window: the first call after
    /// the threshold is crossed returns `true`; subsequent calls (absent
    /// intervening activity) return `false` until activity resets the clock.
    pub async fn should_nudge(&self) -> bool {
        if self.threshold.is_zero() {
            return false;
        }
        if self.idle_for().await < self.threshold {
            return false;
        }
        !self.inner.nudged_this_window.swap(true, Ordering::SeqCst)
    }

    /// Drives a background loop that polls `should_nudge` on an interval
    /// and invokes `on_nudge` when it fires. Intended to run as a spawned
    /// task for the lifetime of a `running` task state.
    pub async fn run_nudge_loop<F, Fut>(&self, poll_interval: Duration, mut on_nudge: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            if self.should_nudge().await {
                on_nudge().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn freshly_created_monitor_is_not_idle() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = IdleMonitor::new(dir.path(), DEFAULT_IDLE_THRESHOLD_SECS);
        assert!(!monitor.should_nudge().await);
    }

    #[tokio::test]
    async fn zero_threshold_disables_nudging() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = IdleMonitor::new(dir.path(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!monitor.should_nudge().await);
    }

    #[tokio::test]
    async fn nudges_once_then_stays_quiet_until_activity_resets_it() {
        let dir = tempfile::tempdir().unwrap();
        // a near-zero threshold so the test doesn't actually wait 600s
        let monitor = IdleMonitor::new(dir.path(), 0);
        // simulate a crossed threshold by forcing a tiny threshold manually
        let mut forced = monitor.clone();
        forced.threshold = Duration::from_millis(1);
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(forced.should_nudge().await);
        assert!(!forced.should_nudge().await);

        forced.record_activity().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(forced.should_nudge().await);
    }
}
