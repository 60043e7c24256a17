//! Keep-alive monitor.
//!
//! One background thread per pool. Every `heartCheckInterval` it probes each
//! idle connection (taken out of the queue first, so no lock is held during
//! the round trip), replaces the ones that fail, reaps long-idle ones and
//! tops the pool back up to `minIdle`.

use crate::pool::factory::ConnectionFactory;
use crate::pool::manager::Shared;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use xfer_engine::{TransferError, TransferResult};

/// What one keep-alive pass did.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartCheckReport {
    pub probed: usize,
    pub replaced: usize,
    pub reaped: usize,
    pub added: usize,
}

/// Run flag plus a condvar so `stop()` interrupts the sleep.
struct StopSignal {
    running: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `interval`; returns whether the loop should keep going.
    fn wait(&self, interval: Duration) -> bool {
        let guard = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, interval, |running| *running)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    fn stop(&self) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.wake.notify_all();
    }
}

pub(crate) struct KeepAlive {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub(crate) fn spawn<F: ConnectionFactory>(shared: Arc<Shared<F>>) -> TransferResult<Self> {
        let signal = Arc::new(StopSignal {
            running: Mutex::new(true),
            wake: Condvar::new(),
        });
        let loop_signal = Arc::clone(&signal);
        let interval = shared.config.heart_check_interval();

        let handle = thread::Builder::new()
            .name("xfer-pool-keepalive".into())
            .spawn(move || {
                debug!("pool keep-alive: started (every {:?})", interval);
                while loop_signal.wait(interval) {
                    let report = heart_check(&*shared, &|| loop_signal.is_running());
                    if report.replaced > 0 || report.reaped > 0 {
                        debug!("pool keep-alive: {:?}", report);
                    }
                }
                debug!("pool keep-alive: stopped");
            })
            .map_err(|e| TransferError::internal(format!("Cannot start keep-alive thread: {}", e)))?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Clear the run flag and wait for the loop to observe it.
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("pool keep-alive: thread panicked");
            }
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One pass: probe, replace, reap, top up. Probe failures are logged and
/// handled here; they never reach transfer callers.
pub(crate) fn heart_check<F: ConnectionFactory>(
    shared: &Shared<F>,
    keep_going: &dyn Fn() -> bool,
) -> HeartCheckReport {
    let mut report = HeartCheckReport::default();

    for _ in 0..shared.idle_count() {
        if !keep_going() {
            return report;
        }
        let mut entry = match shared.take_idle_front() {
            Some(entry) => entry,
            None => break,
        };
        report.probed += 1;
        match shared.factory.probe(&mut entry.client) {
            Ok(()) => shared.checkin(entry),
            Err(e) => {
                warn!("pool: probe of connection {} failed: {}; replacing", entry.id, e);
                shared.evict(&entry.id, entry.client, true);
                report.replaced += 1;
                if let Err(e) = shared.add_client() {
                    warn!("pool: replacement connection failed: {}", e);
                }
            }
        }
    }

    report.reaped = shared.reap_idle();

    while keep_going() && shared.needs_top_up() {
        match shared.add_client() {
            Ok(true) => report.added += 1,
            Ok(false) => break,
            Err(e) => {
                warn!("pool: top-up connection failed: {}", e);
                break;
            }
        }
    }

    report
}
