// ── Control connection ────────────────────────────────────────────────────────

use crate::ftp::types::FtpConnectionConfig;
use log::{debug, info};
use std::net::ToSocketAddrs;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode, Status};
use xfer_engine::{TransferError, TransferResult};
use xfer_pool::ConnectionFactory;

/// Opens logged-in, binary-mode [`FtpStream`]s for a pool.
#[derive(Debug, Clone)]
pub struct FtpConnector {
    config: FtpConnectionConfig,
}

impl FtpConnector {
    pub fn new(config: FtpConnectionConfig) -> TransferResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FtpConnectionConfig {
        &self.config
    }

    fn open(&self) -> TransferResult<FtpStream> {
        let addr = self.config.address();
        let resolved = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| TransferError::connectivity(format!("Cannot resolve '{}': {}", addr, e)))?;

        let mut last_err = None;
        for sock in resolved {
            match FtpStream::connect_timeout(sock, self.config.connect_timeout()) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(TransferError::connectivity(match last_err {
            Some(e) => format!("FTP connection to {} failed: {}", addr, e),
            None => format!("'{}' resolved to no addresses", addr),
        }))
    }
}

impl ConnectionFactory for FtpConnector {
    type Client = FtpStream;

    fn connect(&self) -> TransferResult<FtpStream> {
        let mut ftp = self.open()?;

        let timeout = Some(self.config.data_timeout());
        ftp.get_ref()
            .set_read_timeout(timeout)
            .and_then(|_| ftp.get_ref().set_write_timeout(timeout))
            .map_err(|e| TransferError::connectivity(format!("Cannot set FTP socket timeouts: {}", e)))?;

        ftp.login(self.config.username.as_str(), self.config.login_password())
            .map_err(|e| TransferError::connectivity(format!("FTP login failed: {}", e)))?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| TransferError::connectivity(format!("FTP TYPE I rejected: {}", e)))?;
        ftp.set_mode(if self.config.passive { Mode::Passive } else { Mode::Active });

        info!("FTP connected to {}", self.describe());
        Ok(ftp)
    }

    fn probe(&self, client: &mut FtpStream) -> TransferResult<()> {
        client
            .noop()
            .map_err(|e| TransferError::probe_failed(format!("FTP NOOP failed: {}", e)))
    }

    fn disconnect(&self, mut client: FtpStream) {
        if let Err(e) = client.quit() {
            debug!("FTP QUIT to {}: {}", self.describe(), e);
        }
    }

    fn describe(&self) -> String {
        format!("ftp://{}@{}", self.config.username, self.config.address())
    }
}

// ── Error translation ────────────────────────────────────────────────────────

/// 550: the file does not exist (or is not accessible).
pub(crate) fn is_missing_status(status: Status) -> bool {
    status == Status::FileUnavailable
}

pub(crate) fn is_not_found(e: &FtpError) -> bool {
    match e {
        FtpError::UnexpectedResponse(resp) => is_missing_status(resp.status),
        _ => false,
    }
}

/// Failure while sizing or opening a data stream.
pub(crate) fn prepare_error(action: &str, path: &str, e: &FtpError) -> TransferError {
    if is_not_found(e) {
        TransferError::remote_not_found(path)
    } else {
        TransferError::connectivity(format!("FTP {} failed: {}", action, e)).with_path(path)
    }
}

/// Failure while streaming or finalizing a data connection.
pub(crate) fn stream_error(action: &str, path: &str, e: impl std::fmt::Display) -> TransferError {
    TransferError::remote_io(format!("FTP {} failed: {}", action, e)).with_path(path)
}
