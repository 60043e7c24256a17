//! Lock markers: the durable "transfer in progress" checkpoint.
//!
//! A marker exists iff a transfer of its local file is running or was
//! interrupted without cleanup. Two storage backends implement
//! [`LockStore`]: a JSON side-file next to the local file and an
//! in-process registry. Independently of the backend, the process-wide
//! [`ActiveTransfers`] registry guarantees that at most one engine in this
//! process streams a given local path at a time.

use crate::engine::error::{TransferError, TransferResult};
use crate::engine::types::TransferDirection;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

lazy_static! {
    /// Lock paths currently held by a running engine in this process.
    static ref HELD_LOCKS: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

// ── Marker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LockStatus {
    /// An engine claims to be streaming right now.
    Active,
    /// The owner stopped (abort / failure) and released the file for resume.
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockMarker {
    pub owner_id: String,
    pub pid: u32,
    pub direction: TransferDirection,
    pub remote_path: String,
    /// Last offset the owner reported; informational only.
    pub offset: u64,
    pub status: LockStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LockMarker {
    pub fn new(owner_id: impl Into<String>, direction: TransferDirection, remote_path: &str) -> Self {
        let now = Utc::now();
        Self {
            owner_id: owner_id.into(),
            pid: std::process::id(),
            direction,
            remote_path: remote_path.to_string(),
            offset: 0,
            status: LockStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh the recorded offset and heartbeat.
    pub fn touch(&mut self, offset: u64) {
        self.offset = offset;
        self.updated_at = Utc::now();
    }

    /// Seconds since the last heartbeat (0 if the clock went backwards).
    pub fn heartbeat_age_secs(&self) -> u64 {
        (Utc::now() - self.updated_at).num_seconds().max(0) as u64
    }
}

// ── Store trait ──────────────────────────────────────────────────────────────

/// Storage medium for markers, keyed by the marker path
/// ([`TransferDescriptor::lock_path`](crate::engine::types::TransferDescriptor::lock_path)).
pub trait LockStore: Send + Sync {
    /// Read the marker, `None` if absent.
    fn inspect(&self, key: &Path) -> TransferResult<Option<LockMarker>>;
    /// Create or replace the marker.
    fn write(&self, key: &Path, marker: &LockMarker) -> TransferResult<()>;
    /// Create the marker only if none exists, atomically with respect to
    /// other writers. Returns `false` if a marker is already present.
    fn create(&self, key: &Path, marker: &LockMarker) -> TransferResult<bool>;
    /// Delete the marker. Removing an absent marker is not an error.
    fn remove(&self, key: &Path) -> TransferResult<()>;

    fn exists(&self, key: &Path) -> TransferResult<bool> {
        Ok(self.inspect(key)?.is_some())
    }

    /// Offset recorded by the marker's last checkpoint.
    fn recorded_offset(&self, key: &Path) -> TransferResult<Option<u64>> {
        Ok(self.inspect(key)?.map(|m| m.offset))
    }

    /// Swap `expected` for `marker`. Returns `false` if the stored marker
    /// is no longer `expected`, or if another owner replaced it again
    /// before the write could be read back.
    fn replace(&self, key: &Path, expected: &LockMarker, marker: &LockMarker) -> TransferResult<bool> {
        match self.inspect(key)? {
            Some(current) if current == *expected => {}
            _ => return Ok(false),
        }
        self.write(key, marker)?;
        Ok(self
            .inspect(key)?
            .map_or(false, |stored| stored.owner_id == marker.owner_id))
    }
}

// ── Side-file store ──────────────────────────────────────────────────────────

/// Markers as JSON side-files (`<local><suffix>`), replaced atomically via
/// write-to-temp + rename. Creation links the temp file into place, which
/// fails if the marker already exists.
#[derive(Debug, Clone, Default)]
pub struct FileLockStore;

impl FileLockStore {
    pub fn new() -> Self {
        Self
    }

    fn temp_path(key: &Path) -> PathBuf {
        let mut name = key.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Per-owner temp file so concurrent creators never share one.
    fn staging_path(key: &Path, owner_id: &str) -> PathBuf {
        let mut name = key.as_os_str().to_owned();
        name.push(format!(".{}.tmp", owner_id));
        PathBuf::from(name)
    }

    fn ensure_parent(key: &Path) -> TransferResult<()> {
        if let Some(parent) = key.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

impl LockStore for FileLockStore {
    fn inspect(&self, key: &Path) -> TransferResult<Option<LockMarker>> {
        let raw = match fs::read(key) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TransferError::local_io(format!("Cannot read lock marker: {}", e))
                    .with_path(key.display().to_string()))
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(marker) => Ok(Some(marker)),
            Err(e) => Err(TransferError::lock_contention(format!(
                "Unreadable lock marker ({}); remove it manually if no transfer is running",
                e
            ))
            .with_path(key.display().to_string())),
        }
    }

    fn write(&self, key: &Path, marker: &LockMarker) -> TransferResult<()> {
        Self::ensure_parent(key)?;
        let tmp = Self::temp_path(key);
        fs::write(&tmp, serde_json::to_vec_pretty(marker)?)
            .map_err(|e| TransferError::from(e).with_path(tmp.display().to_string()))?;
        fs::rename(&tmp, key)
            .map_err(|e| TransferError::from(e).with_path(key.display().to_string()))?;
        Ok(())
    }

    fn create(&self, key: &Path, marker: &LockMarker) -> TransferResult<bool> {
        Self::ensure_parent(key)?;
        let staged = Self::staging_path(key, &marker.owner_id);
        fs::write(&staged, serde_json::to_vec_pretty(marker)?)
            .map_err(|e| TransferError::from(e).with_path(staged.display().to_string()))?;
        let linked = fs::hard_link(&staged, key);
        if let Err(e) = fs::remove_file(&staged) {
            debug!("lock: cannot remove {}: {}", staged.display(), e);
        }
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(TransferError::from(e).with_path(key.display().to_string())),
        }
    }

    fn remove(&self, key: &Path) -> TransferResult<()> {
        match fs::remove_file(key) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::from(e).with_path(key.display().to_string())),
        }
    }
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// Markers kept in a process-local map. Suitable when every transfer of a
/// file happens inside one long-lived process.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    markers: Mutex<HashMap<PathBuf, LockMarker>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LockStore for MemoryLockStore {
    fn inspect(&self, key: &Path) -> TransferResult<Option<LockMarker>> {
        let map = self.markers.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn write(&self, key: &Path, marker: &LockMarker) -> TransferResult<()> {
        let mut map = self.markers.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.to_path_buf(), marker.clone());
        Ok(())
    }

    fn create(&self, key: &Path, marker: &LockMarker) -> TransferResult<bool> {
        let mut map = self.markers.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_path_buf(), marker.clone());
        Ok(true)
    }

    fn replace(&self, key: &Path, expected: &LockMarker, marker: &LockMarker) -> TransferResult<bool> {
        let mut map = self.markers.lock().unwrap_or_else(PoisonError::into_inner);
        match map.get_mut(key) {
            Some(current) if current == expected => {
                *current = marker.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove(&self, key: &Path) -> TransferResult<()> {
        let mut map = self.markers.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(key);
        Ok(())
    }
}

// ── In-process exclusivity ───────────────────────────────────────────────────

/// Process-wide registry of lock paths held by running engines.
pub struct ActiveTransfers;

impl ActiveTransfers {
    /// Claim `key` for the calling engine. Fails with `LockContention` if
    /// another engine in this process already holds it.
    pub fn claim(key: &Path) -> TransferResult<ActiveClaim> {
        let key = absolute(key);
        let mut held = HELD_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(key.clone()) {
            return Err(TransferError::lock_contention(
                "Another transfer of this file is running in this process",
            )
            .with_path(key.display().to_string()));
        }
        debug!("lock: claimed {}", key.display());
        Ok(ActiveClaim { key })
    }

    pub fn is_held(key: &Path) -> bool {
        let key = absolute(key);
        HELD_LOCKS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
    }
}

/// Releases the in-process claim on drop.
#[derive(Debug)]
pub struct ActiveClaim {
    key: PathBuf,
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        HELD_LOCKS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        debug!("lock: released {}", self.key.display());
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
