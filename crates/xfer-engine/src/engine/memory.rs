//! In-memory remote side with fault injection.
//!
//! Behaves like a tiny remote filesystem: sized files, positioned opens,
//! chunked reads/writes. Faults (offline, refused opens, fail after N
//! bytes) and a per-chunk hook let callers interrupt a transfer at an
//! exact offset.

use crate::engine::error::{TransferError, TransferResult};
use crate::engine::transport::Transport;
use crate::engine::types::TransferDirection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type ChunkHook = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<RemoteInner>>,
    hook: Arc<Mutex<Option<ChunkHook>>>,
}

#[derive(Default)]
struct RemoteInner {
    files: HashMap<String, Vec<u8>>,
    offline: bool,
    /// Positioned opens fail while sizes still answer.
    fail_open: bool,
    /// Bytes allowed through before the next chunk fails (fires once).
    fail_after: Option<u64>,
    bytes_read: u64,
    bytes_written: u64,
}

/// Position of an open in-memory file.
#[derive(Debug)]
pub struct MemoryHandle {
    offset: u64,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, path: &str, data: Vec<u8>) {
        self.state().files.insert(path.to_string(), data);
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn size(&self, path: &str) -> Option<u64> {
        self.state().files.get(path).map(|d| d.len() as u64)
    }

    pub fn remove(&self, path: &str) {
        self.state().files.remove(path);
    }

    /// Every size/open call fails with `Connectivity` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Fail every `open_at` with `Connectivity` while set.
    pub fn fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    /// Let `bytes` through, then fail the next chunk once with `RemoteIo`.
    pub fn fail_after_bytes(&self, bytes: Option<u64>) {
        self.state().fail_after = bytes;
    }

    /// Called after every chunk with the handle's new offset.
    pub fn on_chunk<F>(&self, hook: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    pub fn clear_hook(&self) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn bytes_read(&self) -> u64 {
        self.state().bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.state().bytes_written
    }

    pub fn download(&self, path: &str) -> MemoryDownload {
        MemoryDownload {
            remote: self.clone(),
            path: path.to_string(),
        }
    }

    pub fn upload(&self, path: &str) -> MemoryUpload {
        MemoryUpload {
            remote: self.clone(),
            path: path.to_string(),
        }
    }

    fn remote_size(&self, path: &str) -> TransferResult<Option<u64>> {
        let s = self.state();
        if s.offline {
            return Err(TransferError::connectivity("memory remote is offline").with_path(path));
        }
        Ok(s.files.get(path).map(|d| d.len() as u64))
    }

    fn check_open(&self, path: &str) -> TransferResult<()> {
        let s = self.state();
        if s.offline || s.fail_open {
            return Err(TransferError::connectivity("memory remote refused the open").with_path(path));
        }
        Ok(())
    }

    fn charge(s: &mut RemoteInner, n: u64, path: &str) -> TransferResult<()> {
        if s.offline {
            return Err(TransferError::remote_io("memory remote went offline").with_path(path));
        }
        if let Some(budget) = s.fail_after {
            if n > budget {
                s.fail_after = None;
                return Err(TransferError::remote_io("injected chunk failure").with_path(path));
            }
            s.fail_after = Some(budget - n);
        }
        Ok(())
    }

    fn fire_hook(&self, offset: u64) {
        let hook = self
            .hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(offset);
        }
    }
}

// ── Download ─────────────────────────────────────────────────────────────────

pub struct MemoryDownload {
    remote: MemoryRemote,
    path: String,
}

impl Transport for MemoryDownload {
    type Handle = MemoryHandle;

    fn direction(&self) -> TransferDirection {
        TransferDirection::Download
    }

    fn remote_path(&self) -> &str {
        &self.path
    }

    fn remote_size(&mut self) -> TransferResult<Option<u64>> {
        self.remote.remote_size(&self.path)
    }

    fn open_at(&mut self, offset: u64) -> TransferResult<MemoryHandle> {
        self.remote.check_open(&self.path)?;
        match self.remote.remote_size(&self.path)? {
            None => Err(TransferError::remote_not_found(&self.path)),
            Some(len) if offset > len => Err(TransferError::remote_io(format!(
                "offset {} past end of {} byte file",
                offset, len
            ))
            .with_path(self.path.as_str())),
            Some(_) => Ok(MemoryHandle { offset }),
        }
    }

    fn transfer_chunk(&mut self, handle: &mut MemoryHandle, buf: &mut [u8]) -> TransferResult<usize> {
        let n = {
            let mut s = self.remote.state();
            let len = match s.files.get(&self.path) {
                Some(data) => data.len() as u64,
                None => {
                    return Err(TransferError::remote_io("remote file vanished")
                        .with_path(self.path.as_str()))
                }
            };
            let n = (len.saturating_sub(handle.offset)).min(buf.len() as u64) as usize;
            if n == 0 {
                return Ok(0);
            }
            MemoryRemote::charge(&mut s, n as u64, &self.path)?;
            let start = handle.offset as usize;
            if let Some(data) = s.files.get(&self.path) {
                buf[..n].copy_from_slice(&data[start..start + n]);
            }
            s.bytes_read += n as u64;
            n
        };
        handle.offset += n as u64;
        self.remote.fire_hook(handle.offset);
        Ok(n)
    }

    fn close_handle(&mut self, _handle: MemoryHandle) -> TransferResult<()> {
        Ok(())
    }
}

// ── Upload ───────────────────────────────────────────────────────────────────

pub struct MemoryUpload {
    remote: MemoryRemote,
    path: String,
}

impl Transport for MemoryUpload {
    type Handle = MemoryHandle;

    fn direction(&self) -> TransferDirection {
        TransferDirection::Upload
    }

    fn remote_path(&self) -> &str {
        &self.path
    }

    fn remote_size(&mut self) -> TransferResult<Option<u64>> {
        self.remote.remote_size(&self.path)
    }

    fn open_at(&mut self, offset: u64) -> TransferResult<MemoryHandle> {
        self.remote.check_open(&self.path)?;
        let mut s = self.remote.state();
        if offset == 0 {
            s.files.insert(self.path.clone(), Vec::new());
            return Ok(MemoryHandle { offset });
        }
        match s.files.get(&self.path) {
            Some(data) if data.len() as u64 >= offset => Ok(MemoryHandle { offset }),
            Some(data) => Err(TransferError::remote_io(format!(
                "offset {} past end of {} byte file",
                offset,
                data.len()
            ))
            .with_path(self.path.as_str())),
            None => Err(TransferError::remote_not_found(&self.path)),
        }
    }

    fn transfer_chunk(&mut self, handle: &mut MemoryHandle, buf: &mut [u8]) -> TransferResult<usize> {
        let n = buf.len();
        {
            let mut s = self.remote.state();
            MemoryRemote::charge(&mut s, n as u64, &self.path)?;
            let data = s.files.entry(self.path.clone()).or_default();
            let start = handle.offset as usize;
            if data.len() < start {
                return Err(TransferError::remote_io("write past end of remote file")
                    .with_path(self.path.as_str()));
            }
            if data.len() < start + n {
                data.resize(start + n, 0);
            }
            data[start..start + n].copy_from_slice(buf);
            s.bytes_written += n as u64;
        }
        handle.offset += n as u64;
        self.remote.fire_hook(handle.offset);
        Ok(n)
    }

    fn close_handle(&mut self, _handle: MemoryHandle) -> TransferResult<()> {
        Ok(())
    }
}
