//! SFTP upload/download transports.
//!
//! Each transport holds one checked-out session for its whole life. Any
//! remote failure other than "no such file" marks the session broken, so it
//! is closed instead of going back to the pool when the engine releases it.

use crate::sftp::client::{prepare_error, stream_error, SftpClient, SftpConnector};
use ssh2::{File, OpenFlags, OpenType};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use xfer_engine::{Transport, TransferDirection, TransferError, TransferErrorKind, TransferResult};
use xfer_pool::{ConnectionPool, PooledConnection};

/// Flags for opening the upload target at `offset`. A fresh upload
/// truncates; a resume keeps the confirmed prefix and seeks past it.
pub(crate) fn upload_flags(offset: u64) -> OpenFlags {
    if offset == 0 {
        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
    } else {
        OpenFlags::WRITE
    }
}

// ── Shared session handling ──────────────────────────────────────────────────

struct Channel {
    conn: Option<PooledConnection<SftpConnector>>,
    path: String,
}

impl Channel {
    fn client(&mut self) -> TransferResult<&mut SftpClient> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(TransferError::invalid_state("SFTP transport already released")),
        }
    }

    /// Record a failure; anything but a missing file poisons the session.
    fn fail(&mut self, err: TransferError) -> TransferError {
        if err.kind != TransferErrorKind::RemoteNotFound {
            if let Some(conn) = self.conn.as_mut() {
                conn.mark_broken();
            }
        }
        err
    }

    fn size(&mut self) -> TransferResult<Option<u64>> {
        let path = self.path.clone();
        let result = self.client()?.sftp.stat(Path::new(&path));
        let stat = match result {
            Ok(stat) => stat,
            Err(e) if crate::sftp::client::is_not_found(&e) => return Ok(None),
            Err(e) => return Err(self.fail(prepare_error("stat", &path, &e))),
        };
        if stat.is_dir() {
            return Err(TransferError::remote_io("Remote path is a directory").with_path(path));
        }
        Ok(Some(stat.size.unwrap_or(0)))
    }

    fn seek(&mut self, file: &mut File, offset: u64) -> TransferResult<()> {
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| stream_error("seek", &self.path, e))
                .map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    fn close(&mut self, mut file: File) -> TransferResult<()> {
        match file.close() {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = stream_error("close", &self.path, e);
                Err(self.fail(err))
            }
        }
    }

    fn release(&mut self) {
        self.conn.take();
    }
}

// ── Download ─────────────────────────────────────────────────────────────────

pub struct SftpDownload {
    channel: Channel,
}

impl SftpDownload {
    pub fn new(conn: PooledConnection<SftpConnector>, remote_path: impl Into<String>) -> Self {
        Self {
            channel: Channel {
                conn: Some(conn),
                path: remote_path.into(),
            },
        }
    }

    /// Check out a session from `pool` and bind it to `remote_path`.
    pub fn acquire(pool: &ConnectionPool<SftpConnector>, remote_path: impl Into<String>) -> TransferResult<Self> {
        Ok(Self::new(pool.acquire()?, remote_path))
    }
}

impl Transport for SftpDownload {
    type Handle = File;

    fn direction(&self) -> TransferDirection {
        TransferDirection::Download
    }

    fn remote_path(&self) -> &str {
        &self.channel.path
    }

    fn remote_size(&mut self) -> TransferResult<Option<u64>> {
        self.channel.size()
    }

    fn open_at(&mut self, offset: u64) -> TransferResult<File> {
        let path = self.channel.path.clone();
        let opened = self.channel.client()?.sftp.open(Path::new(&path));
        let mut file = opened.map_err(|e| {
            let err = prepare_error("open", &path, &e);
            self.channel.fail(err)
        })?;
        self.channel.seek(&mut file, offset)?;
        Ok(file)
    }

    fn transfer_chunk(&mut self, handle: &mut File, buf: &mut [u8]) -> TransferResult<usize> {
        handle.read(buf).map_err(|e| {
            let err = stream_error("read", &self.channel.path, e);
            self.channel.fail(err)
        })
    }

    fn close_handle(&mut self, handle: File) -> TransferResult<()> {
        self.channel.close(handle)
    }

    fn release(&mut self) {
        self.channel.release();
    }
}

// ── Upload ───────────────────────────────────────────────────────────────────

pub struct SftpUpload {
    channel: Channel,
}

impl SftpUpload {
    pub fn new(conn: PooledConnection<SftpConnector>, remote_path: impl Into<String>) -> Self {
        Self {
            channel: Channel {
                conn: Some(conn),
                path: remote_path.into(),
            },
        }
    }

    pub fn acquire(pool: &ConnectionPool<SftpConnector>, remote_path: impl Into<String>) -> TransferResult<Self> {
        Ok(Self::new(pool.acquire()?, remote_path))
    }
}

impl Transport for SftpUpload {
    type Handle = File;

    fn direction(&self) -> TransferDirection {
        TransferDirection::Upload
    }

    fn remote_path(&self) -> &str {
        &self.channel.path
    }

    fn remote_size(&mut self) -> TransferResult<Option<u64>> {
        self.channel.size()
    }

    fn open_at(&mut self, offset: u64) -> TransferResult<File> {
        let path = self.channel.path.clone();
        let opened = self.channel.client()?.sftp.open_mode(
            Path::new(&path),
            upload_flags(offset),
            0o644,
            OpenType::File,
        );
        let mut file = opened.map_err(|e| {
            let err = prepare_error("open", &path, &e);
            self.channel.fail(err)
        })?;
        self.channel.seek(&mut file, offset)?;
        Ok(file)
    }

    fn transfer_chunk(&mut self, handle: &mut File, buf: &mut [u8]) -> TransferResult<usize> {
        match handle.write_all(buf) {
            Ok(()) => Ok(buf.len()),
            Err(e) => {
                let err = stream_error("write", &self.channel.path, e);
                Err(self.channel.fail(err))
            }
        }
    }

    fn close_handle(&mut self, handle: File) -> TransferResult<()> {
        self.channel.close(handle)
    }

    fn release(&mut self) {
        self.channel.release();
    }
}
