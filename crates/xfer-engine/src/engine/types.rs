// ── Types ─────────────────────────────────────────────────────────────────────

use crate::engine::error::{TransferError, TransferResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_chunk_size() -> usize {
    1_048_576 // 1 MiB
}
fn default_lock_suffix() -> String {
    ".lock".to_string()
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_checkpoint_interval_ms() -> u64 {
    2000
}

/// Largest accepted `chunkSize`; one buffer of this size is allocated per run.
pub const MAX_CHUNK_SIZE: usize = 256 * 1024 * 1024;

// ── Direction ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Upload,
    Download,
}

// ── Descriptor ───────────────────────────────────────────────────────────────

/// Identifies one logical transfer. Immutable once the engine is built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferDescriptor {
    pub remote_path: String,
    pub local_path: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_lock_suffix")]
    pub lock_suffix: String,
}

impl TransferDescriptor {
    pub fn new(remote_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            chunk_size: default_chunk_size(),
            lock_suffix: default_lock_suffix(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_lock_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.lock_suffix = suffix.into();
        self
    }

    /// Path of the lock marker guarding `local_path`.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.local_path.clone().into_os_string();
        name.push(&self.lock_suffix);
        PathBuf::from(name)
    }

    pub fn local(&self) -> &Path {
        &self.local_path
    }

    pub fn validate(&self) -> TransferResult<()> {
        if self.chunk_size == 0 {
            return Err(TransferError::invalid_config("chunkSize must be > 0"));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::invalid_config(format!(
                "chunkSize {} exceeds the {} byte maximum",
                self.chunk_size, MAX_CHUNK_SIZE
            )));
        }
        if self.remote_path.trim().is_empty() {
            return Err(TransferError::invalid_config("remotePath is empty"));
        }
        if self.local_path.as_os_str().is_empty() {
            return Err(TransferError::invalid_config("localPath is empty"));
        }
        if self.lock_suffix.is_empty() {
            return Err(TransferError::invalid_config(
                "lockSuffix is empty; the marker would overwrite the local file",
            ));
        }
        Ok(())
    }
}

// ── Options ──────────────────────────────────────────────────────────────────

/// What to do with an `active` lock marker that no engine in this process
/// holds (another process, or a crash that skipped cleanup).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StaleLockPolicy {
    /// Surface `LockContention`; an operator removes the marker by hand.
    #[default]
    Refuse,
    /// Treat the owner as dead and resume.
    Reclaim,
    /// Resume only if the marker's heartbeat is older than `secs`.
    ReclaimAfter { secs: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: default_retry_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferOptions {
    /// Always restart at offset 0, discarding partial data.
    #[serde(default)]
    pub force_override: bool,
    /// Re-transfer when destination size already equals source size
    /// instead of reporting "already complete".
    #[serde(default)]
    pub file_size_equal_override: bool,
    #[serde(default)]
    pub stale_lock_policy: StaleLockPolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// How often the running engine refreshes the marker's offset/heartbeat.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    /// Hash the finished local file with SHA-256.
    #[serde(default)]
    pub verify_checksum: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            force_override: false,
            file_size_equal_override: false,
            stale_lock_policy: StaleLockPolicy::default(),
            retry: RetryPolicy::default(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            verify_checksum: false,
        }
    }
}

impl TransferOptions {
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

// ── Phase / state ────────────────────────────────────────────────────────────

/// `Idle -> Preparing -> Running -> {Completed | Aborted | Failed}`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferPhase {
    Idle,
    Preparing,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl TransferPhase {
    pub fn as_u8(self) -> u8 {
        match self {
            TransferPhase::Idle => 0,
            TransferPhase::Preparing => 1,
            TransferPhase::Running => 2,
            TransferPhase::Completed => 3,
            TransferPhase::Aborted => 4,
            TransferPhase::Failed => 5,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => TransferPhase::Preparing,
            2 => TransferPhase::Running,
            3 => TransferPhase::Completed,
            4 => TransferPhase::Aborted,
            5 => TransferPhase::Failed,
            _ => TransferPhase::Idle,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferPhase::Completed | TransferPhase::Aborted | TransferPhase::Failed
        )
    }
}

/// Point-in-time view of one engine's mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferState {
    pub current_offset: u64,
    /// `-1` until the source size is known.
    pub total_size: i64,
    pub done: bool,
    pub aborted: bool,
    pub error: Option<TransferError>,
    pub phase: TransferPhase,
}

// ── Progress snapshot ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub bytes_done: u64,
    /// `-1` while unknown.
    pub total_bytes: i64,
    pub elapsed_nanos: u64,
    pub instant_rate_bytes_per_sec: f64,
    pub avg_rate_bytes_per_sec: f64,
}

impl ProgressSnapshot {
    /// `bytes_done / total_bytes`, or `None` while the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            t if t < 0 => None,
            0 => Some(1.0),
            t => Some((self.bytes_done as f64 / t as f64).min(1.0)),
        }
    }

    pub fn percent(&self) -> Option<f64> {
        self.fraction().map(|f| f * 100.0)
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos)
    }

    /// Remaining time at the instantaneous rate.
    pub fn eta(&self) -> Option<Duration> {
        if self.total_bytes < 0 || self.instant_rate_bytes_per_sec <= 0.0 {
            return None;
        }
        let remaining = (self.total_bytes as u64).saturating_sub(self.bytes_done);
        Some(Duration::from_secs_f64(
            remaining as f64 / self.instant_rate_bytes_per_sec,
        ))
    }
}

// ── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    pub direction: TransferDirection,
    /// Offset the run started streaming from (0 for a fresh transfer).
    pub resumed_from: u64,
    /// Bytes moved by this run only.
    pub bytes_transferred: u64,
    pub final_size: u64,
    pub duration_ms: u64,
    pub average_speed_bps: f64,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum TransferOutcome {
    Completed(TransferReport),
    /// Destination already matched the source; nothing was moved.
    AlreadyComplete { size: u64 },
    /// Stopped by `abort()`; marker and partial data kept for a resume.
    Aborted { offset: u64 },
}
