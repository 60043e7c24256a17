//! Transfer engine: drives one descriptor through
//! `Idle -> Preparing -> Running -> {Completed | Aborted | Failed}`.
//!
//! Resume offsets always come from an observed size (local length for
//! downloads, remote size for uploads), never from a counter that may be
//! stale after a crash. Chunk N is written only after chunk N-1 returned,
//! so the observed size always equals the durably written prefix.

use crate::engine::checksum::file_sha256;
use crate::engine::error::{TransferError, TransferResult};
use crate::engine::local;
use crate::engine::lock::{ActiveClaim, ActiveTransfers, LockMarker, LockStatus, LockStore};
use crate::engine::progress::ProgressTracker;
use crate::engine::transport::Transport;
use crate::engine::types::*;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use uuid::Uuid;

// ── Control handle ───────────────────────────────────────────────────────────

/// Thread-safe view of a running engine: abort it, poll its progress.
#[derive(Clone)]
pub struct TransferControl {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    id: String,
    aborted: AtomicBool,
    phase: AtomicU8,
    tracker: ProgressTracker,
    last_error: Mutex<Option<TransferError>>,
}

impl TransferControl {
    fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                id: Uuid::new_v4().to_string(),
                aborted: AtomicBool::new(false),
                phase: AtomicU8::new(TransferPhase::Idle.as_u8()),
                tracker: ProgressTracker::default(),
                last_error: Mutex::new(None),
            }),
        }
    }

    /// Engine instance id; recorded as the lock marker's owner.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Request cooperative cancellation; observed once per chunk.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> TransferPhase {
        TransferPhase::from_u8(self.inner.phase.load(Ordering::Acquire))
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.inner.tracker.snapshot()
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.inner.tracker
    }

    pub fn last_error(&self) -> Option<TransferError> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> TransferState {
        let phase = self.phase();
        TransferState {
            current_offset: self.inner.tracker.bytes_done(),
            total_size: self.inner.tracker.total_bytes(),
            done: phase == TransferPhase::Completed,
            aborted: self.is_aborted(),
            error: self.last_error(),
            phase,
        }
    }

    fn set_phase(&self, phase: TransferPhase) {
        self.inner.phase.store(phase.as_u8(), Ordering::Release);
    }

    fn clear_abort(&self) {
        self.inner.aborted.store(false, Ordering::Release);
    }

    fn set_error(&self, err: Option<TransferError>) {
        *self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = err;
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct TransferEngine<T: Transport> {
    descriptor: TransferDescriptor,
    options: TransferOptions,
    transport: Option<T>,
    locks: Arc<dyn LockStore>,
    control: TransferControl,
}

impl<T: Transport> TransferEngine<T> {
    pub fn new(
        transport: T,
        descriptor: TransferDescriptor,
        locks: Arc<dyn LockStore>,
    ) -> TransferResult<Self> {
        descriptor.validate()?;
        if transport.remote_path() != descriptor.remote_path {
            return Err(TransferError::invalid_config(format!(
                "transport bound to '{}' but descriptor names '{}'",
                transport.remote_path(),
                descriptor.remote_path
            )));
        }
        Ok(Self {
            descriptor,
            options: TransferOptions::default(),
            transport: Some(transport),
            locks,
            control: TransferControl::new(),
        })
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    pub fn force_override(&mut self, enabled: bool) -> &mut Self {
        self.options.force_override = enabled;
        self
    }

    pub fn file_size_equal_override(&mut self, enabled: bool) -> &mut Self {
        self.options.file_size_equal_override = enabled;
        self
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn direction(&self) -> Option<TransferDirection> {
        self.transport.as_ref().map(|t| t.direction())
    }

    /// Clonable handle for other threads (abort, progress polling).
    pub fn control(&self) -> TransferControl {
        self.control.clone()
    }

    pub fn abort(&self) {
        self.control.abort();
    }

    pub fn get_progress(&self) -> ProgressSnapshot {
        self.control.progress()
    }

    pub fn state(&self) -> TransferState {
        self.control.state()
    }

    pub fn phase(&self) -> TransferPhase {
        self.control.phase()
    }

    /// Run the transfer to completion, abort or failure (blocking).
    ///
    /// After `Completed`, further calls return `AlreadyComplete` without
    /// touching either side. After `Aborted`/`Failed`, a call resumes.
    pub fn run(&mut self) -> TransferResult<TransferOutcome> {
        if self.transport.is_none() {
            return Err(TransferError::invalid_state("Transfer engine is closed"));
        }
        match self.control.phase() {
            TransferPhase::Completed => {
                debug!("transfer {}: already completed", self.control.id());
                return Ok(TransferOutcome::AlreadyComplete {
                    size: self.control.tracker().bytes_done(),
                });
            }
            TransferPhase::Aborted | TransferPhase::Failed => self.control.clear_abort(),
            _ => {}
        }

        let mut attempt = 0u32;
        loop {
            let result = match self.transport.as_mut() {
                Some(transport) => Attempt {
                    transport,
                    descriptor: &self.descriptor,
                    options: &self.options,
                    locks: self.locks.as_ref(),
                    control: &self.control,
                }
                .execute(),
                None => Err(TransferError::invalid_state("Transfer engine is closed")),
            };
            match result {
                Err(e)
                    if e.is_retryable()
                        && attempt < self.options.retry.max_retries
                        && !self.control.is_aborted() =>
                {
                    attempt += 1;
                    warn!(
                        "transfer {}: {} (retry {}/{} in {:?})",
                        self.control.id(),
                        e,
                        attempt,
                        self.options.retry.max_retries,
                        self.options.retry.delay()
                    );
                    std::thread::sleep(self.options.retry.delay());
                }
                other => return other,
            }
        }
    }

    /// Release the transport (and its pooled connection). Idempotent; the
    /// lock marker is left alone.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.release();
            debug!("transfer {}: closed", self.control.id());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }
}

impl<T: Transport> Drop for TransferEngine<T> {
    fn drop(&mut self) {
        self.close();
    }
}

// ── One attempt ──────────────────────────────────────────────────────────────

enum Plan {
    Complete { size: u64 },
    Stream { offset: u64, total: Option<u64> },
}

/// Marker held for the duration of one attempt.
struct Lease {
    key: PathBuf,
    marker: LockMarker,
    previous: Option<LockMarker>,
    _claim: ActiveClaim,
}

struct Attempt<'a, T: Transport> {
    transport: &'a mut T,
    descriptor: &'a TransferDescriptor,
    options: &'a TransferOptions,
    locks: &'a dyn LockStore,
    control: &'a TransferControl,
}

impl<'a, T: Transport> Attempt<'a, T> {
    fn id(&self) -> &str {
        self.control.id()
    }

    fn execute(mut self) -> TransferResult<TransferOutcome> {
        self.control.set_phase(TransferPhase::Preparing);
        self.control.set_error(None);
        let direction = self.transport.direction();

        if self.control.is_aborted() {
            self.control.set_phase(TransferPhase::Aborted);
            return Ok(TransferOutcome::Aborted {
                offset: self.control.tracker().bytes_done(),
            });
        }

        // Observe both sides first; a connectivity failure leaves nothing behind.
        let remote_size = self.transport.remote_size().map_err(|e| self.fail(e))?;
        let local_size = local::local_len(&self.descriptor.local_path).map_err(|e| self.fail(e))?;

        let mut lease = self.claim(direction).map_err(|e| self.fail(e))?;

        let plan = match direction {
            TransferDirection::Download => {
                self.plan_download(remote_size, local_size, lease.previous.is_some())
            }
            TransferDirection::Upload => self.plan_upload(remote_size, local_size),
        };
        let (offset, total) = match plan {
            Ok(Plan::Stream { offset, total }) => (offset, total),
            Ok(Plan::Complete { size }) => return self.already_complete(lease, size),
            Err(e) => {
                self.restore(lease);
                return Err(self.fail(e));
            }
        };

        let (handle, local_file) = match self.open(direction, offset) {
            Ok(opened) => opened,
            Err(e) => {
                self.restore(lease);
                return Err(self.fail(e));
            }
        };

        lease.marker.touch(offset);
        if let Err(e) = self.locks.write(&lease.key, &lease.marker) {
            warn!("transfer {}: cannot checkpoint marker: {}", self.id(), e);
        }

        self.stream(direction, lease, handle, local_file, offset, total)
    }

    // ── Preparing ────────────────────────────────────────────────────────────

    fn claim(&self, direction: TransferDirection) -> TransferResult<Lease> {
        let key = self.descriptor.lock_path();
        let claim = ActiveTransfers::claim(&key)?;
        let previous = self.locks.inspect(&key)?;

        if let Some(prev) = &previous {
            match prev.status {
                LockStatus::Interrupted => info!(
                    "transfer {}: found interrupted transfer (checkpoint {} bytes)",
                    self.id(),
                    prev.offset
                ),
                LockStatus::Active => {
                    let age = prev.heartbeat_age_secs();
                    let reclaim = match self.options.stale_lock_policy {
                        StaleLockPolicy::Refuse => false,
                        StaleLockPolicy::Reclaim => true,
                        StaleLockPolicy::ReclaimAfter { secs } => age >= secs,
                    };
                    if !reclaim {
                        return Err(TransferError::lock_contention(format!(
                            "Transfer marker held by owner {} (pid {}, heartbeat {}s ago)",
                            prev.owner_id, prev.pid, age
                        ))
                        .with_path(key.display().to_string()));
                    }
                    warn!(
                        "transfer {}: reclaiming marker of owner {} (heartbeat {}s ago)",
                        self.id(),
                        prev.owner_id,
                        age
                    );
                }
            }
        }

        let mut marker = LockMarker::new(self.id(), direction, &self.descriptor.remote_path);
        let owned = match &previous {
            Some(prev) => {
                marker.created_at = prev.created_at;
                marker.offset = prev.offset;
                self.locks.replace(&key, prev, &marker)?
            }
            None => self.locks.create(&key, &marker)?,
        };
        if !owned {
            let holder = self
                .locks
                .inspect(&key)
                .ok()
                .flatten()
                .map(|m| format!("owner {} (pid {})", m.owner_id, m.pid))
                .unwrap_or_else(|| "another transfer".to_string());
            return Err(TransferError::lock_contention(format!(
                "Transfer marker was taken by {} while claiming",
                holder
            ))
            .with_path(key.display().to_string()));
        }

        Ok(Lease {
            key,
            marker,
            previous,
            _claim: claim,
        })
    }

    fn plan_download(
        &self,
        remote: Option<u64>,
        local: Option<u64>,
        has_marker: bool,
    ) -> TransferResult<Plan> {
        let remote = remote.ok_or_else(|| TransferError::remote_not_found(&self.descriptor.remote_path))?;
        let restart = Plan::Stream {
            offset: 0,
            total: Some(remote),
        };
        if self.options.force_override {
            info!("transfer {}: forced restart", self.id());
            return Ok(restart);
        }
        Ok(match local {
            Some(len) if len == remote => {
                if self.options.file_size_equal_override {
                    info!("transfer {}: sizes equal, re-downloading", self.id());
                    restart
                } else {
                    Plan::Complete { size: remote }
                }
            }
            Some(len) if has_marker && len < remote => Plan::Stream {
                offset: len,
                total: Some(remote),
            },
            Some(len) if has_marker => {
                warn!(
                    "transfer {}: local partial ({} bytes) exceeds remote ({} bytes); restarting",
                    self.id(),
                    len,
                    remote
                );
                restart
            }
            Some(len) => {
                info!(
                    "transfer {}: {} untracked local bytes without a marker; restarting",
                    self.id(),
                    len
                );
                restart
            }
            None => restart,
        })
    }

    fn plan_upload(&self, remote: Option<u64>, local: Option<u64>) -> TransferResult<Plan> {
        let local = local.ok_or_else(|| {
            TransferError::local_io("Local source file not found")
                .with_path(self.descriptor.local_path.display().to_string())
        })?;
        let restart = Plan::Stream {
            offset: 0,
            total: Some(local),
        };
        Ok(match remote {
            None => restart,
            Some(_) if self.options.force_override => {
                info!("transfer {}: forced restart, truncating remote", self.id());
                restart
            }
            Some(size) if size == local => {
                if self.options.file_size_equal_override {
                    info!("transfer {}: sizes equal, re-uploading", self.id());
                    restart
                } else {
                    Plan::Complete { size: local }
                }
            }
            Some(size) if size < local => Plan::Stream {
                offset: size,
                total: Some(local),
            },
            Some(size) => {
                warn!(
                    "transfer {}: remote ({} bytes) larger than local ({} bytes); restarting",
                    self.id(),
                    size,
                    local
                );
                restart
            }
        })
    }

    fn open(&mut self, direction: TransferDirection, offset: u64) -> TransferResult<(T::Handle, File)> {
        let path = &self.descriptor.local_path;
        match direction {
            TransferDirection::Download => {
                let handle = self.transport.open_at(offset)?;
                let file = if offset == 0 {
                    local::create_truncated(path)
                } else {
                    local::open_write_at(path, offset)
                };
                match file {
                    Ok(file) => Ok((handle, file)),
                    Err(e) => {
                        let _ = self.transport.close_handle(handle);
                        Err(e)
                    }
                }
            }
            TransferDirection::Upload => {
                let file = local::open_read_at(path, offset)?;
                let handle = self.transport.open_at(offset)?;
                Ok((handle, file))
            }
        }
    }

    fn already_complete(&self, lease: Lease, size: u64) -> TransferResult<TransferOutcome> {
        self.locks.remove(&lease.key).map_err(|e| self.fail(e))?;
        let tracker = self.control.tracker();
        tracker.start(size, Some(size));
        tracker.finish(true);
        self.control.set_phase(TransferPhase::Completed);
        info!(
            "transfer {}: '{}' already complete ({} bytes)",
            self.id(),
            self.descriptor.remote_path,
            size
        );
        Ok(TransferOutcome::AlreadyComplete { size })
    }

    // ── Running ──────────────────────────────────────────────────────────────

    fn stream(
        &mut self,
        direction: TransferDirection,
        mut lease: Lease,
        mut handle: T::Handle,
        mut local_file: File,
        start: u64,
        mut total: Option<u64>,
    ) -> TransferResult<TransferOutcome> {
        let tracker = self.control.tracker().clone();
        tracker.start(start, total);
        self.control.set_phase(TransferPhase::Running);
        info!(
            "transfer {}: {:?} '{}' from offset {} of {:?}",
            self.id(),
            direction,
            self.descriptor.remote_path,
            start,
            total
        );

        let started = Instant::now();
        let checkpoint_every = self.options.checkpoint_interval();
        let mut last_checkpoint = Instant::now();
        let mut offset = start;
        let mut buf = vec![0u8; self.descriptor.chunk_size];

        let result: TransferResult<bool> = loop {
            if self.control.is_aborted() {
                break Ok(true);
            }
            let step = match direction {
                TransferDirection::Download => self.download_chunk(&mut handle, &mut local_file, &mut buf),
                TransferDirection::Upload => self.upload_chunk(&mut handle, &mut local_file, &mut buf),
            };
            match step {
                Ok(0) => break Ok(false),
                Ok(n) => {
                    offset += n as u64;
                    tracker.add_bytes(n as u64);
                    if total.map(|t| offset > t).unwrap_or(false) {
                        // Source grew while we were copying.
                        total = Some(offset);
                        tracker.set_total(total);
                    }
                    if last_checkpoint.elapsed() >= checkpoint_every {
                        lease.marker.touch(offset);
                        if let Err(e) = self.locks.write(&lease.key, &lease.marker) {
                            warn!("transfer {}: cannot checkpoint marker: {}", self.id(), e);
                        }
                        last_checkpoint = Instant::now();
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let closed = self.transport.close_handle(handle);

        match result {
            Ok(false) => {
                if let Err(e) = closed {
                    return Err(self.interrupt(lease, offset, TransferPhase::Failed, Some(e)));
                }
                if let Err(e) = self.finish_local(direction, &local_file, offset, total) {
                    return Err(self.interrupt(lease, offset, TransferPhase::Failed, Some(e)));
                }
                drop(local_file);
                self.complete(direction, lease, start, offset, started)
            }
            Ok(true) => {
                if let Err(e) = closed {
                    warn!("transfer {}: close after abort failed: {}", self.id(), e);
                }
                let _ = local_file.flush();
                self.interrupt(lease, offset, TransferPhase::Aborted, None);
                info!("transfer {}: aborted at offset {}", self.id(), offset);
                Ok(TransferOutcome::Aborted { offset })
            }
            Err(e) => {
                if let Err(close_err) = closed {
                    warn!("transfer {}: close after failure failed: {}", self.id(), close_err);
                }
                let _ = local_file.flush();
                Err(self.interrupt(lease, offset, TransferPhase::Failed, Some(e)))
            }
        }
    }

    fn download_chunk(&mut self, handle: &mut T::Handle, file: &mut File, buf: &mut [u8]) -> TransferResult<usize> {
        let n = self.transport.transfer_chunk(handle, buf)?;
        if n > 0 {
            file.write_all(&buf[..n]).map_err(|e| {
                TransferError::local_io(format!("Write error: {}", e))
                    .with_path(self.descriptor.local_path.display().to_string())
            })?;
        }
        Ok(n)
    }

    fn upload_chunk(&mut self, handle: &mut T::Handle, file: &mut File, buf: &mut [u8]) -> TransferResult<usize> {
        let n = loop {
            match file.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(TransferError::local_io(format!("Read error: {}", e))
                        .with_path(self.descriptor.local_path.display().to_string()))
                }
            }
        };
        if n == 0 {
            return Ok(0);
        }
        let written = self.transport.transfer_chunk(handle, &mut buf[..n])?;
        if written != n {
            return Err(TransferError::remote_io(format!(
                "short remote write ({} of {} bytes)",
                written, n
            ))
            .with_path(self.descriptor.remote_path.as_str()));
        }
        Ok(n)
    }

    /// Make downloaded bytes durable and check the source ended where expected.
    fn finish_local(
        &self,
        direction: TransferDirection,
        file: &File,
        offset: u64,
        total: Option<u64>,
    ) -> TransferResult<()> {
        if direction == TransferDirection::Download {
            file.sync_all().map_err(|e| {
                TransferError::local_io(format!("Sync error: {}", e))
                    .with_path(self.descriptor.local_path.display().to_string())
            })?;
        }
        match total {
            Some(expected) if offset < expected => Err(TransferError::integrity(format!(
                "source ended at {} bytes, expected {}",
                offset, expected
            ))
            .with_path(self.descriptor.remote_path.as_str())),
            _ => Ok(()),
        }
    }

    // ── Completed / Aborted / Failed ─────────────────────────────────────────

    fn complete(
        &self,
        direction: TransferDirection,
        lease: Lease,
        start: u64,
        offset: u64,
        started: Instant,
    ) -> TransferResult<TransferOutcome> {
        self.locks.remove(&lease.key).map_err(|e| self.fail(e))?;
        drop(lease);

        self.control.tracker().finish(true);
        self.control.set_phase(TransferPhase::Completed);

        let moved = offset - start;
        let duration_ms = started.elapsed().as_millis().max(1) as u64;
        let checksum = if self.options.verify_checksum {
            match file_sha256(&self.descriptor.local_path) {
                Ok(sum) => Some(sum),
                Err(e) => {
                    warn!("transfer {}: checksum failed: {}", self.id(), e);
                    None
                }
            }
        } else {
            None
        };

        info!(
            "transfer {}: completed '{}' ({} bytes, {} this run)",
            self.id(),
            self.descriptor.remote_path,
            offset,
            moved
        );
        Ok(TransferOutcome::Completed(TransferReport {
            direction,
            resumed_from: start,
            bytes_transferred: moved,
            final_size: offset,
            duration_ms,
            average_speed_bps: moved as f64 / (duration_ms as f64 / 1000.0),
            checksum,
        }))
    }

    /// Leave the marker behind as `interrupted` with the final offset.
    fn interrupt(
        &self,
        mut lease: Lease,
        offset: u64,
        phase: TransferPhase,
        error: Option<TransferError>,
    ) -> TransferError {
        lease.marker.status = LockStatus::Interrupted;
        lease.marker.touch(offset);
        if let Err(e) = self.locks.write(&lease.key, &lease.marker) {
            warn!("transfer {}: cannot persist interrupted marker: {}", self.id(), e);
        }
        self.control.tracker().finish(false);
        self.control.set_phase(phase);
        match error {
            Some(e) => {
                warn!("transfer {}: failed at offset {}: {}", self.id(), offset, e);
                self.control.set_error(Some(e.clone()));
                e
            }
            None => TransferError::invalid_state("transfer aborted"),
        }
    }

    /// Undo a claim made during a Preparing step that then failed.
    fn restore(&self, lease: Lease) {
        let result = match &lease.previous {
            Some(prev) => {
                let mut prev = prev.clone();
                prev.status = LockStatus::Interrupted;
                self.locks.write(&lease.key, &prev)
            }
            None => self.locks.remove(&lease.key),
        };
        if let Err(e) = result {
            warn!("transfer {}: cannot restore marker: {}", self.id(), e);
        }
    }

    fn fail(&self, e: TransferError) -> TransferError {
        self.control.set_phase(TransferPhase::Failed);
        self.control.set_error(Some(e.clone()));
        warn!("transfer {}: preparing failed: {}", self.id(), e);
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::TransferErrorKind;
    use crate::engine::lock::{FileLockStore, MemoryLockStore};
    use crate::engine::memory::MemoryRemote;
    use std::fs;

    const KIB: usize = 1024;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn memory_locks() -> Arc<dyn LockStore> {
        Arc::new(MemoryLockStore::new())
    }

    #[test]
    fn fresh_download_completes_and_removes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("out.bin");
        let remote = MemoryRemote::new();
        remote.put("/r/out.bin", pattern(100 * KIB));

        let locks: Arc<dyn LockStore> = Arc::new(FileLockStore::new());
        let desc = TransferDescriptor::new("/r/out.bin", &local).with_chunk_size(8 * KIB);
        let lock_path = desc.lock_path();
        let mut engine = TransferEngine::new(remote.download("/r/out.bin"), desc, locks).unwrap();

        let outcome = engine.run().unwrap();
        match outcome {
            TransferOutcome::Completed(report) => {
                assert_eq!(report.resumed_from, 0);
                assert_eq!(report.bytes_transferred, 100 * KIB as u64);
                assert_eq!(report.final_size, 100 * KIB as u64);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs::read(&local).unwrap(), pattern(100 * KIB));
        assert!(!lock_path.exists());
        let state = engine.state();
        assert!(state.done);
        assert_eq!(state.current_offset, state.total_size as u64);
        assert_eq!(engine.get_progress().fraction(), Some(1.0));
    }

    #[test]
    fn second_run_after_completion_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("f.bin");
        let remote = MemoryRemote::new();
        remote.put("/f", pattern(10 * KIB));
        let mut engine = TransferEngine::new(
            remote.download("/f"),
            TransferDescriptor::new("/f", &local).with_chunk_size(KIB),
            memory_locks(),
        )
        .unwrap();

        engine.run().unwrap();
        let read_after_first = remote.bytes_read();
        let outcome = engine.run().unwrap();
        assert_eq!(outcome, TransferOutcome::AlreadyComplete { size: 10 * KIB as u64 });
        assert_eq!(remote.bytes_read(), read_after_first);
    }

    #[test]
    fn abort_keeps_marker_and_resume_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big.bin");
        let remote = MemoryRemote::new();
        let data = pattern(64 * KIB);
        remote.put("/big", data.clone());
        let locks = memory_locks();
        let desc = TransferDescriptor::new("/big", &local).with_chunk_size(4 * KIB);

        let mut first = TransferEngine::new(remote.download("/big"), desc.clone(), locks.clone()).unwrap();
        let ctl = first.control();
        remote.on_chunk(move |off| {
            if off == 20 * KIB as u64 {
                ctl.abort();
            }
        });
        assert_eq!(
            first.run().unwrap(),
            TransferOutcome::Aborted { offset: 20 * KIB as u64 }
        );
        assert_eq!(first.phase(), TransferPhase::Aborted);
        assert!(!first.state().done);
        let marker = locks.inspect(&desc.lock_path()).unwrap().unwrap();
        assert_eq!(marker.status, LockStatus::Interrupted);
        assert_eq!(marker.offset, 20 * KIB as u64);
        first.close();
        first.close();
        remote.clear_hook();

        let mut second = TransferEngine::new(remote.download("/big"), desc.clone(), locks.clone()).unwrap();
        match second.run().unwrap() {
            TransferOutcome::Completed(report) => {
                assert_eq!(report.resumed_from, 20 * KIB as u64);
                assert_eq!(report.bytes_transferred, 44 * KIB as u64);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs::read(&local).unwrap(), data);
        assert_eq!(remote.bytes_read(), 64 * KIB as u64);
        assert!(locks.inspect(&desc.lock_path()).unwrap().is_none());
    }

    #[test]
    fn mid_transfer_failure_preserves_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("p.bin");
        let remote = MemoryRemote::new();
        let data = pattern(32 * KIB);
        remote.put("/p", data.clone());
        remote.fail_after_bytes(Some(12 * KIB as u64));
        let locks = memory_locks();
        let desc = TransferDescriptor::new("/p", &local).with_chunk_size(4 * KIB);

        let mut engine = TransferEngine::new(remote.download("/p"), desc.clone(), locks.clone()).unwrap();
        let err = engine.run().unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::RemoteIo);
        assert_eq!(engine.phase(), TransferPhase::Failed);
        assert_eq!(engine.state().error.unwrap().kind, TransferErrorKind::RemoteIo);
        assert_eq!(fs::read(&local).unwrap(), data[..12 * KIB].to_vec());
        assert!(locks.exists(&desc.lock_path()).unwrap());

        // Same instance resumes on the next run.
        match engine.run().unwrap() {
            TransferOutcome::Completed(report) => assert_eq!(report.resumed_from, 12 * KIB as u64),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs::read(&local).unwrap(), data);
    }

    #[test]
    fn retry_policy_resumes_within_one_run() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("r.bin");
        let remote = MemoryRemote::new();
        let data = pattern(16 * KIB);
        remote.put("/r", data.clone());
        remote.fail_after_bytes(Some(8 * KIB as u64));

        let options = TransferOptions {
            retry: RetryPolicy {
                max_retries: 2,
                delay_ms: 1,
            },
            ..TransferOptions::default()
        };
        let mut engine = TransferEngine::new(
            remote.download("/r"),
            TransferDescriptor::new("/r", &local).with_chunk_size(2 * KIB),
            memory_locks(),
        )
        .unwrap()
        .with_options(options);

        match engine.run().unwrap() {
            TransferOutcome::Completed(report) => assert_eq!(report.resumed_from, 8 * KIB as u64),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs::read(&local).unwrap(), data);
    }

    #[test]
    fn connectivity_failure_creates_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("c.bin");
        let remote = MemoryRemote::new();
        remote.put("/c", pattern(KIB));
        remote.set_offline(true);
        let locks = memory_locks();
        let desc = TransferDescriptor::new("/c", &local);

        let mut engine = TransferEngine::new(remote.download("/c"), desc.clone(), locks.clone()).unwrap();
        let err = engine.run().unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::Connectivity);
        assert!(!locks.exists(&desc.lock_path()).unwrap());
        assert!(!local.exists());

        remote.set_offline(false);
        assert!(matches!(engine.run().unwrap(), TransferOutcome::Completed(_)));
    }

    #[test]
    fn missing_remote_is_not_found_and_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("m.bin");
        let locks = memory_locks();
        let desc = TransferDescriptor::new("/missing", &local);
        let mut engine =
            TransferEngine::new(MemoryRemote::new().download("/missing"), desc.clone(), locks.clone()).unwrap();
        assert_eq!(engine.run().unwrap_err().kind, TransferErrorKind::RemoteNotFound);
        assert!(!locks.exists(&desc.lock_path()).unwrap());
    }

    #[test]
    fn active_marker_is_refused_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.bin");
        let remote = MemoryRemote::new();
        remote.put("/a", pattern(KIB));
        let locks = memory_locks();
        let desc = TransferDescriptor::new("/a", &local);
        let foreign = LockMarker::new("other-process", TransferDirection::Download, "/a");
        locks.write(&desc.lock_path(), &foreign).unwrap();

        let mut engine = TransferEngine::new(remote.download("/a"), desc.clone(), locks.clone()).unwrap();
        assert_eq!(engine.run().unwrap_err().kind, TransferErrorKind::LockContention);
        assert_eq!(
            locks.inspect(&desc.lock_path()).unwrap().unwrap().owner_id,
            "other-process"
        );

        engine.options.stale_lock_policy = StaleLockPolicy::Reclaim;
        assert!(matches!(engine.run().unwrap(), TransferOutcome::Completed(_)));
    }

    #[test]
    fn reclaim_after_honours_heartbeat_age() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("h.bin");
        let remote = MemoryRemote::new();
        remote.put("/h", pattern(KIB));
        let locks = memory_locks();
        let desc = TransferDescriptor::new("/h", &local);
        let mut foreign = LockMarker::new("other", TransferDirection::Download, "/h");
        locks.write(&desc.lock_path(), &foreign).unwrap();

        let options = TransferOptions {
            stale_lock_policy: StaleLockPolicy::ReclaimAfter { secs: 60 },
            ..TransferOptions::default()
        };
        let mut engine = TransferEngine::new(remote.download("/h"), desc.clone(), locks.clone())
            .unwrap()
            .with_options(options);
        assert_eq!(engine.run().unwrap_err().kind, TransferErrorKind::LockContention);

        foreign.updated_at = chrono::Utc::now() - chrono::Duration::seconds(600);
        locks.write(&desc.lock_path(), &foreign).unwrap();
        assert!(matches!(engine.run().unwrap(), TransferOutcome::Completed(_)));
    }

    /// Memory store that lets another owner write `intruder` right after
    /// the first lookup, as a second process would.
    struct InterleavedStore {
        inner: MemoryLockStore,
        intruder: Mutex<Option<LockMarker>>,
    }

    impl InterleavedStore {
        fn new(intruder: LockMarker) -> Self {
            Self {
                inner: MemoryLockStore::new(),
                intruder: Mutex::new(Some(intruder)),
            }
        }
    }

    impl LockStore for InterleavedStore {
        fn inspect(&self, key: &std::path::Path) -> TransferResult<Option<LockMarker>> {
            let seen = self.inner.inspect(key)?;
            if let Some(intruder) = self.intruder.lock().unwrap().take() {
                self.inner.write(key, &intruder)?;
            }
            Ok(seen)
        }

        fn write(&self, key: &std::path::Path, marker: &LockMarker) -> TransferResult<()> {
            self.inner.write(key, marker)
        }

        fn create(&self, key: &std::path::Path, marker: &LockMarker) -> TransferResult<bool> {
            self.inner.create(key, marker)
        }

        fn replace(
            &self,
            key: &std::path::Path,
            expected: &LockMarker,
            marker: &LockMarker,
        ) -> TransferResult<bool> {
            self.inner.replace(key, expected, marker)
        }

        fn remove(&self, key: &std::path::Path) -> TransferResult<()> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn marker_created_during_claim_is_contention() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("race.bin");
        let remote = MemoryRemote::new();
        remote.put("/race", pattern(4 * KIB));
        let desc = TransferDescriptor::new("/race", &local);
        let store = Arc::new(InterleavedStore::new(LockMarker::new(
            "other-process",
            TransferDirection::Download,
            "/race",
        )));

        let mut engine = TransferEngine::new(remote.download("/race"), desc.clone(), store.clone()).unwrap();
        let err = engine.run().unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::LockContention);
        let marker = store.inner.inspect(&desc.lock_path()).unwrap().unwrap();
        assert_eq!(marker.owner_id, "other-process");
        assert_eq!(marker.status, LockStatus::Active);
        assert_eq!(remote.bytes_read(), 0);
        assert!(!local.exists());
    }

    #[test]
    fn marker_replaced_during_resume_claim_is_contention() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("race2.bin");
        fs::write(&local, pattern(KIB)).unwrap();
        let remote = MemoryRemote::new();
        remote.put("/race2", pattern(4 * KIB));
        let desc = TransferDescriptor::new("/race2", &local);

        let store = Arc::new(InterleavedStore::new(LockMarker::new(
            "other-process",
            TransferDirection::Download,
            "/race2",
        )));
        let mut interrupted = LockMarker::new("crashed", TransferDirection::Download, "/race2");
        interrupted.touch(KIB as u64);
        interrupted.status = LockStatus::Interrupted;
        store.inner.write(&desc.lock_path(), &interrupted).unwrap();

        let mut engine = TransferEngine::new(remote.download("/race2"), desc.clone(), store.clone()).unwrap();
        assert_eq!(engine.run().unwrap_err().kind, TransferErrorKind::LockContention);
        let marker = store.inner.inspect(&desc.lock_path()).unwrap().unwrap();
        assert_eq!(marker.owner_id, "other-process");
        assert_eq!(remote.bytes_read(), 0);
        assert_eq!(fs::read(&local).unwrap(), pattern(KIB));
    }

    #[test]
    fn failed_open_without_marker_leaves_none() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("o.bin");
        let remote = MemoryRemote::new();
        remote.put("/o", pattern(8 * KIB));
        remote.fail_open(true);
        let locks = memory_locks();
        let desc = TransferDescriptor::new("/o", &local);

        let mut engine = TransferEngine::new(remote.download("/o"), desc.clone(), locks.clone()).unwrap();
        assert_eq!(engine.run().unwrap_err().kind, TransferErrorKind::Connectivity);
        assert_eq!(engine.phase(), TransferPhase::Failed);
        assert!(!locks.exists(&desc.lock_path()).unwrap());
        assert!(!ActiveTransfers::is_held(&desc.lock_path()));
        assert!(!local.exists());

        remote.fail_open(false);
        assert!(matches!(engine.run().unwrap(), TransferOutcome::Completed(_)));
    }

    #[test]
    fn failed_open_keeps_interrupted_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("k.bin");
        let data = pattern(8 * KIB);
        fs::write(&local, &data[..3 * KIB]).unwrap();
        let remote = MemoryRemote::new();
        remote.put("/k", data.clone());
        remote.fail_open(true);
        let locks = memory_locks();
        let desc = TransferDescriptor::new("/k", &local);

        let mut previous = LockMarker::new("earlier-run", TransferDirection::Download, "/k");
        previous.touch(3 * KIB as u64);
        previous.status = LockStatus::Interrupted;
        locks.write(&desc.lock_path(), &previous).unwrap();

        let mut engine = TransferEngine::new(remote.download("/k"), desc.clone(), locks.clone()).unwrap();
        assert_eq!(engine.run().unwrap_err().kind, TransferErrorKind::Connectivity);
        let kept = locks.inspect(&desc.lock_path()).unwrap().unwrap();
        assert_eq!(kept.status, LockStatus::Interrupted);
        assert_eq!(kept.offset, 3 * KIB as u64);
        assert_eq!(kept.owner_id, "earlier-run");
        assert_eq!(fs::read(&local).unwrap(), data[..3 * KIB].to_vec());

        remote.fail_open(false);
        match engine.run().unwrap() {
            TransferOutcome::Completed(report) => assert_eq!(report.resumed_from, 3 * KIB as u64),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs::read(&local).unwrap(), data);
    }

    #[test]
    fn concurrent_engine_in_process_is_contention() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("x.bin");
        let remote = MemoryRemote::new();
        remote.put("/x", pattern(KIB));
        let desc = TransferDescriptor::new("/x", &local);

        let _held = ActiveTransfers::claim(&desc.lock_path()).unwrap();
        let mut engine = TransferEngine::new(remote.download("/x"), desc, memory_locks()).unwrap();
        assert_eq!(engine.run().unwrap_err().kind, TransferErrorKind::LockContention);
    }

    #[test]
    fn equal_sizes_without_marker_is_already_complete() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("eq.bin");
        let data = pattern(4 * KIB);
        fs::write(&local, &data).unwrap();
        let remote = MemoryRemote::new();
        remote.put("/eq", data.clone());

        let mut engine = TransferEngine::new(
            remote.download("/eq"),
            TransferDescriptor::new("/eq", &local),
            memory_locks(),
        )
        .unwrap();
        assert_eq!(
            engine.run().unwrap(),
            TransferOutcome::AlreadyComplete { size: 4 * KIB as u64 }
        );
        assert_eq!(remote.bytes_read(), 0);
    }

    #[test]
    fn size_equal_override_redownloads() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("eqo.bin");
        fs::write(&local, vec![0u8; 4 * KIB]).unwrap();
        let remote = MemoryRemote::new();
        let data = pattern(4 * KIB);
        remote.put("/eqo", data.clone());

        let mut engine = TransferEngine::new(
            remote.download("/eqo"),
            TransferDescriptor::new("/eqo", &local),
            memory_locks(),
        )
        .unwrap();
        engine.file_size_equal_override(true);
        assert!(matches!(engine.run().unwrap(), TransferOutcome::Completed(_)));
        assert_eq!(fs::read(&local).unwrap(), data);
    }

    #[test]
    fn partial_without_marker_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("nm.bin");
        fs::write(&local, b"garbage").unwrap();
        let remote = MemoryRemote::new();
        let data = pattern(2 * KIB);
        remote.put("/nm", data.clone());

        let mut engine = TransferEngine::new(
            remote.download("/nm"),
            TransferDescriptor::new("/nm", &local),
            memory_locks(),
        )
        .unwrap();
        match engine.run().unwrap() {
            TransferOutcome::Completed(report) => assert_eq!(report.resumed_from, 0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs::read(&local).unwrap(), data);
    }

    #[test]
    fn upload_resumes_from_remote_size() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.bin");
        let data = pattern(10 * KIB);
        fs::write(&local, &data).unwrap();
        let remote = MemoryRemote::new();
        remote.put("/up", data[..3 * KIB].to_vec());

        let mut engine = TransferEngine::new(
            remote.upload("/up"),
            TransferDescriptor::new("/up", &local).with_chunk_size(KIB),
            memory_locks(),
        )
        .unwrap();
        match engine.run().unwrap() {
            TransferOutcome::Completed(report) => {
                assert_eq!(report.resumed_from, 3 * KIB as u64);
                assert_eq!(report.direction, TransferDirection::Upload);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(remote.get("/up").unwrap(), data);
        assert_eq!(remote.bytes_written(), 7 * KIB as u64);
    }

    #[test]
    fn upload_missing_local_is_local_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = TransferEngine::new(
            MemoryRemote::new().upload("/u"),
            TransferDescriptor::new("/u", dir.path().join("none.bin")),
            memory_locks(),
        )
        .unwrap();
        assert_eq!(engine.run().unwrap_err().kind, TransferErrorKind::LocalIo);
    }

    #[test]
    fn abort_before_run_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MemoryRemote::new();
        remote.put("/z", pattern(KIB));
        let mut engine = TransferEngine::new(
            remote.download("/z"),
            TransferDescriptor::new("/z", dir.path().join("z.bin")),
            memory_locks(),
        )
        .unwrap();
        engine.abort();
        assert_eq!(engine.run().unwrap(), TransferOutcome::Aborted { offset: 0 });
        assert_eq!(remote.bytes_read(), 0);
    }

    #[test]
    fn run_after_close_is_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = TransferEngine::new(
            MemoryRemote::new().download("/q"),
            TransferDescriptor::new("/q", dir.path().join("q.bin")),
            memory_locks(),
        )
        .unwrap();
        engine.close();
        assert!(engine.is_closed());
        assert_eq!(engine.run().unwrap_err().kind, TransferErrorKind::InvalidState);
    }

    #[test]
    fn mismatched_descriptor_is_rejected() {
        let result = TransferEngine::new(
            MemoryRemote::new().download("/one"),
            TransferDescriptor::new("/two", "/tmp/two.bin"),
            memory_locks(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn checksum_is_reported_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("sum.bin");
        let remote = MemoryRemote::new();
        let data = pattern(3 * KIB);
        remote.put("/sum", data.clone());
        let options = TransferOptions {
            verify_checksum: true,
            ..TransferOptions::default()
        };
        let mut engine = TransferEngine::new(
            remote.download("/sum"),
            TransferDescriptor::new("/sum", &local),
            memory_locks(),
        )
        .unwrap()
        .with_options(options);
        match engine.run().unwrap() {
            TransferOutcome::Completed(report) => assert_eq!(
                report.checksum.as_deref(),
                Some(crate::engine::checksum::bytes_sha256(&data).as_str())
            ),
            other => panic!("unexpected {:?}", other),
        }
    }
}
