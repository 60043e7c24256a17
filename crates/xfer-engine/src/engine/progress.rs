use crate::engine::types::ProgressSnapshot;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default time slice for the instantaneous rate.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(1);

const UNSET: u64 = u64::MAX;

// ---- Tracker ----
//
// Written from the copy loop, read from anywhere (UI polling, sampler).
// Every counter is an atomic; timestamps are nanoseconds since `epoch`
// so they fit in an `AtomicU64`.

/// Byte counters plus instantaneous / average rate for one transfer.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    epoch: Instant,
    window_nanos: u64,
    started_at: AtomicU64,
    finished_at: AtomicU64,
    succeeded: AtomicBool,
    /// Current offset, including bytes a resume skipped.
    bytes_done: AtomicU64,
    /// Bytes moved since `start()`; drives the average rate.
    session_bytes: AtomicU64,
    total_bytes: AtomicI64,
    window_start: AtomicU64,
    window_bytes: AtomicU64,
    /// f64 bits of the last closed window's rate.
    last_window_rate: AtomicU64,
    has_last_window: AtomicBool,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW)
    }
}

impl ProgressTracker {
    pub fn new(rate_window: Duration) -> Self {
        let window_nanos = (rate_window.as_nanos() as u64).max(1);
        Self {
            inner: Arc::new(TrackerInner {
                epoch: Instant::now(),
                window_nanos,
                started_at: AtomicU64::new(UNSET),
                finished_at: AtomicU64::new(UNSET),
                succeeded: AtomicBool::new(false),
                bytes_done: AtomicU64::new(0),
                session_bytes: AtomicU64::new(0),
                total_bytes: AtomicI64::new(-1),
                window_start: AtomicU64::new(0),
                window_bytes: AtomicU64::new(0),
                last_window_rate: AtomicU64::new(0f64.to_bits()),
                has_last_window: AtomicBool::new(false),
            }),
        }
    }

    fn now_nanos(&self) -> u64 {
        self.inner.epoch.elapsed().as_nanos() as u64
    }

    /// Begin (or restart) timing at `offset` bytes already in place.
    pub fn start(&self, offset: u64, total: Option<u64>) {
        let i = &self.inner;
        let now = self.now_nanos();
        i.bytes_done.store(offset, Ordering::Release);
        i.session_bytes.store(0, Ordering::Release);
        i.total_bytes
            .store(total.map(|t| t as i64).unwrap_or(-1), Ordering::Release);
        i.window_bytes.store(0, Ordering::Release);
        i.window_start.store(now, Ordering::Release);
        i.has_last_window.store(false, Ordering::Release);
        i.last_window_rate.store(0f64.to_bits(), Ordering::Release);
        i.succeeded.store(false, Ordering::Release);
        i.finished_at.store(UNSET, Ordering::Release);
        i.started_at.store(now, Ordering::Release);
    }

    pub fn set_total(&self, total: Option<u64>) {
        self.inner
            .total_bytes
            .store(total.map(|t| t as i64).unwrap_or(-1), Ordering::Release);
    }

    /// Record `n` bytes durably moved.
    pub fn add_bytes(&self, n: u64) {
        let i = &self.inner;
        i.bytes_done.fetch_add(n, Ordering::AcqRel);
        i.session_bytes.fetch_add(n, Ordering::AcqRel);

        let now = self.now_nanos();
        let window_start = i.window_start.load(Ordering::Acquire);
        let age = now.saturating_sub(window_start);
        if age >= i.window_nanos {
            // Close the window, this chunk included.
            let bytes = i.window_bytes.swap(0, Ordering::AcqRel) + n;
            let rate = bytes as f64 / (age as f64 / 1e9);
            i.last_window_rate.store(rate.to_bits(), Ordering::Release);
            i.has_last_window.store(true, Ordering::Release);
            i.window_start.store(now, Ordering::Release);
        } else {
            i.window_bytes.fetch_add(n, Ordering::AcqRel);
        }
    }

    /// Stop the clock. On success the offset is pinned to the total.
    pub fn finish(&self, success: bool) {
        let i = &self.inner;
        if success {
            let done = i.bytes_done.load(Ordering::Acquire);
            let total = i.total_bytes.load(Ordering::Acquire);
            if total < 0 {
                i.total_bytes.store(done as i64, Ordering::Release);
            } else if (total as u64) > done {
                i.bytes_done.store(total as u64, Ordering::Release);
            }
        }
        i.succeeded.store(success, Ordering::Release);
        i.finished_at.store(self.now_nanos(), Ordering::Release);
    }

    pub fn bytes_done(&self) -> u64 {
        self.inner.bytes_done.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> i64 {
        self.inner.total_bytes.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.inner.started_at.load(Ordering::Acquire) != UNSET
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished_at.load(Ordering::Acquire) != UNSET
    }

    pub fn succeeded(&self) -> bool {
        self.inner.succeeded.load(Ordering::Acquire)
    }

    /// `bytes_done / total_bytes`, `None` while the total is unknown.
    pub fn get_progress(&self) -> Option<f64> {
        self.snapshot().fraction()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let i = &self.inner;
        let now = self.now_nanos();
        let started = i.started_at.load(Ordering::Acquire);
        let finished = i.finished_at.load(Ordering::Acquire);

        let elapsed_nanos = match (started, finished) {
            (UNSET, _) => 0,
            (s, UNSET) => now.saturating_sub(s),
            (s, f) => f.saturating_sub(s),
        };

        let session = i.session_bytes.load(Ordering::Acquire);
        let avg_rate = if elapsed_nanos == 0 {
            0.0
        } else {
            session as f64 / (elapsed_nanos as f64 / 1e9)
        };

        let instant_rate = if started == UNSET || finished != UNSET {
            0.0
        } else {
            self.instant_rate(now)
        };

        ProgressSnapshot {
            bytes_done: i.bytes_done.load(Ordering::Acquire),
            total_bytes: i.total_bytes.load(Ordering::Acquire),
            elapsed_nanos,
            instant_rate_bytes_per_sec: instant_rate,
            avg_rate_bytes_per_sec: avg_rate,
        }
    }

    fn instant_rate(&self, now: u64) -> f64 {
        let i = &self.inner;
        let window_start = i.window_start.load(Ordering::Acquire);
        let bytes = i.window_bytes.load(Ordering::Acquire);
        let age = now.saturating_sub(window_start);

        if age < i.window_nanos && i.has_last_window.load(Ordering::Acquire) {
            return f64::from_bits(i.last_window_rate.load(Ordering::Acquire));
        }
        // First window still filling: spread its bytes over a whole window.
        // No chunk since the window elapsed: a stall decays towards zero.
        let span = age.max(i.window_nanos);
        bytes as f64 / (span as f64 / 1e9)
    }

    /// Emit a snapshot every `interval` on a background thread until the
    /// returned sampler is stopped/dropped or the tracker finishes (one
    /// final snapshot is emitted after `finish`).
    pub fn spawn_sampler<F>(&self, interval: Duration, mut callback: F) -> ProgressSampler
    where
        F: FnMut(ProgressSnapshot) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let tracker = self.clone();
        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let finished = tracker.is_finished();
                    callback(tracker.snapshot());
                    if finished {
                        break;
                    }
                }
                // Explicit stop or sampler dropped.
                _ => break,
            }
        });
        ProgressSampler {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }
}

// ---- Sampler handle ----

/// Background snapshot emitter; stops on `stop()` or drop.
pub struct ProgressSampler {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressSampler {
    /// Signal the sampler and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressSampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
