//! FTP upload/download transports.
//!
//! Downloads position with `REST` before `RETR`. Uploads use `STOR` for a
//! fresh start (which truncates) and `APPE` to resume, which is exact
//! because the engine only resumes an upload at the current remote size.
//! Closing a handle reads the server's transfer-complete reply, so a short
//! transfer surfaces there.

use crate::ftp::client::{is_not_found, prepare_error, stream_error, FtpConnector};
use std::io::{Read, Write};
use suppaftp::FtpStream;
use xfer_engine::{Transport, TransferDirection, TransferError, TransferErrorKind, TransferResult};
use xfer_pool::{ConnectionPool, PooledConnection};

pub type RetrStream = Box<dyn Read + Send>;
pub type StorStream = Box<dyn Write + Send>;

/// Which command opens the upload data connection at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreCommand {
    Stor,
    Appe,
}

pub(crate) fn store_command(offset: u64) -> StoreCommand {
    if offset == 0 {
        StoreCommand::Stor
    } else {
        StoreCommand::Appe
    }
}

// ── Shared control connection ────────────────────────────────────────────────

struct Channel {
    conn: Option<PooledConnection<FtpConnector>>,
    path: String,
}

impl Channel {
    fn ftp(&mut self) -> TransferResult<&mut FtpStream> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(TransferError::invalid_state("FTP transport already released")),
        }
    }

    /// A failed control exchange leaves the connection in an unknown state;
    /// a missing file does not.
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
        let result = self.ftp()?.size(path.as_str());
        match result {
            Ok(n) => Ok(Some(n as u64)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(self.fail(prepare_error("SIZE", &path, &e))),
        }
    }

    fn release(&mut self) {
        self.conn.take();
    }
}

// ── Download ─────────────────────────────────────────────────────────────────

pub struct FtpDownload {
    channel: Channel,
}

impl FtpDownload {
    pub fn new(conn: PooledConnection<FtpConnector>, remote_path: impl Into<String>) -> Self {
        Self {
            channel: Channel {
                conn: Some(conn),
                path: remote_path.into(),
            },
        }
    }

    pub fn acquire(pool: &ConnectionPool<FtpConnector>, remote_path: impl Into<String>) -> TransferResult<Self> {
        Ok(Self::new(pool.acquire()?, remote_path))
    }
}

impl Transport for FtpDownload {
    type Handle = RetrStream;

    fn direction(&self) -> TransferDirection {
        TransferDirection::Download
    }

    fn remote_path(&self) -> &str {
        &self.channel.path
    }

    fn remote_size(&mut self) -> TransferResult<Option<u64>> {
        self.channel.size()
    }

    fn open_at(&mut self, offset: u64) -> TransferResult<RetrStream> {
        let path = self.channel.path.clone();
        let ftp = self.channel.ftp()?;
        let opened = if offset > 0 {
            ftp.resume_transfer(offset as usize)
                .and_then(|_| ftp.retr_as_stream(path.as_str()))
        } else {
            ftp.retr_as_stream(path.as_str())
        };
        match opened {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) => Err(self.channel.fail(prepare_error("RETR", &path, &e))),
        }
    }

    fn transfer_chunk(&mut self, handle: &mut RetrStream, buf: &mut [u8]) -> TransferResult<usize> {
        match handle.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let err = stream_error("read", &self.channel.path, e);
                Err(self.channel.fail(err))
            }
        }
    }

    fn close_handle(&mut self, handle: RetrStream) -> TransferResult<()> {
        let result = self.channel.ftp()?.finalize_retr_stream(handle);
        result.map_err(|e| {
            let err = stream_error("RETR completion", &self.channel.path, e);
            self.channel.fail(err)
        })
    }

    fn release(&mut self) {
        self.channel.release();
    }
}

// ── Upload ───────────────────────────────────────────────────────────────────

pub struct FtpUpload {
    channel: Channel,
}

impl FtpUpload {
    pub fn new(conn: PooledConnection<FtpConnector>, remote_path: impl Into<String>) -> Self {
        Self {
            channel: Channel {
                conn: Some(conn),
                path: remote_path.into(),
            },
        }
    }

    pub fn acquire(pool: &ConnectionPool<FtpConnector>, remote_path: impl Into<String>) -> TransferResult<Self> {
        Ok(Self::new(pool.acquire()?, remote_path))
    }
}

impl Transport for FtpUpload {
    type Handle = StorStream;

    fn direction(&self) -> TransferDirection {
        TransferDirection::Upload
    }

    fn remote_path(&self) -> &str {
        &self.channel.path
    }

    fn remote_size(&mut self) -> TransferResult<Option<u64>> {
        self.channel.size()
    }

    fn open_at(&mut self, offset: u64) -> TransferResult<StorStream> {
        let path = self.channel.path.clone();
        let command = store_command(offset);
        let ftp = self.channel.ftp()?;
        let opened = match command {
            StoreCommand::Stor => ftp.put_with_stream(path.as_str()),
            StoreCommand::Appe => ftp.append_with_stream(path.as_str()),
        };
        match opened {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) => {
                let action = match command {
                    StoreCommand::Stor => "STOR",
                    StoreCommand::Appe => "APPE",
                };
                Err(self.channel.fail(prepare_error(action, &path, &e)))
            }
        }
    }

    fn transfer_chunk(&mut self, handle: &mut StorStream, buf: &mut [u8]) -> TransferResult<usize> {
        match handle.write_all(buf) {
            Ok(()) => Ok(buf.len()),
            Err(e) => {
                let err = stream_error("write", &self.channel.path, e);
                Err(self.channel.fail(err))
            }
        }
    }

    fn close_handle(&mut self, handle: StorStream) -> TransferResult<()> {
        let result = self.channel.ftp()?.finalize_put_stream(handle);
        result.map_err(|e| {
            let err = stream_error("STOR completion", &self.channel.path, e);
            self.channel.fail(err)
        })
    }

    fn release(&mut self) {
        self.channel.release();
    }
}
