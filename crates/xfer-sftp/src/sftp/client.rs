// ── Session establishment ─────────────────────────────────────────────────────

use crate::sftp::types::SftpConnectionConfig;
use log::{debug, info};
use ssh2::{ErrorCode, Session, Sftp};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use xfer_engine::{TransferError, TransferResult};
use xfer_pool::ConnectionFactory;

/// `LIBSSH2_FX_NO_SUCH_FILE`
const FX_NO_SUCH_FILE: i32 = 2;
/// `LIBSSH2_FX_NO_SUCH_PATH`
const FX_NO_SUCH_PATH: i32 = 10;

/// An authenticated SSH session with its SFTP channel.
pub struct SftpClient {
    pub session: Session,
    pub sftp: Sftp,
}

/// Opens [`SftpClient`]s for a [`ConnectionPool`](xfer_pool::ConnectionPool).
#[derive(Debug, Clone)]
pub struct SftpConnector {
    config: SftpConnectionConfig,
}

impl SftpConnector {
    pub fn new(config: SftpConnectionConfig) -> TransferResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SftpConnectionConfig {
        &self.config
    }

    fn open_tcp(&self) -> TransferResult<TcpStream> {
        let addr = self.config.address();
        let resolved = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| TransferError::connectivity(format!("Cannot resolve '{}': {}", addr, e)))?;

        let mut last_err = None;
        for sock in resolved {
            match TcpStream::connect_timeout(&sock, self.config.timeout()) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => last_err = Some(e),
            }
        }
        Err(TransferError::connectivity(match last_err {
            Some(e) => format!("TCP connection to {} failed: {}", addr, e),
            None => format!("'{}' resolved to no addresses", addr),
        }))
    }

    fn authenticate(&self, session: &Session) -> TransferResult<&'static str> {
        let cfg = &self.config;

        if cfg.use_agent {
            if let Ok(mut agent) = session.agent() {
                if agent.connect().is_ok() {
                    let _ = agent.list_identities();
                    for identity in agent.identities().unwrap_or_default() {
                        if agent.userauth(&cfg.username, &identity).is_ok() {
                            return Ok("agent");
                        }
                    }
                }
            }
        }

        if let Some(key_path) = &cfg.private_key_path {
            session
                .userauth_pubkey_file(
                    &cfg.username,
                    None,
                    Path::new(key_path),
                    cfg.private_key_passphrase.as_deref(),
                )
                .map_err(|e| TransferError::connectivity(format!("Public-key auth failed: {}", e)))?;
            if session.authenticated() {
                return Ok("publickey");
            }
        }

        if let Some(password) = &cfg.password {
            if session.userauth_password(&cfg.username, password).is_ok() && session.authenticated() {
                return Ok("password");
            }
        }

        Err(TransferError::connectivity(format!(
            "No authentication method succeeded for {}",
            self.describe()
        )))
    }
}

impl ConnectionFactory for SftpConnector {
    type Client = SftpClient;

    fn connect(&self) -> TransferResult<SftpClient> {
        let tcp = self.open_tcp()?;

        let mut session = Session::new()
            .map_err(|e| TransferError::connectivity(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout((self.config.timeout_secs * 1000).min(u32::MAX as u64) as u32);
        session
            .handshake()
            .map_err(|e| TransferError::connectivity(format!("SSH handshake failed: {}", e)))?;

        let method = self.authenticate(&session)?;
        let sftp = session
            .sftp()
            .map_err(|e| TransferError::connectivity(format!("SFTP subsystem unavailable: {}", e)))?;

        info!("SFTP connected to {} via {}", self.describe(), method);
        Ok(SftpClient { session, sftp })
    }

    fn probe(&self, client: &mut SftpClient) -> TransferResult<()> {
        client
            .session
            .keepalive_send()
            .map_err(|e| TransferError::probe_failed(format!("SSH keepalive failed: {}", e)))?;
        client
            .sftp
            .realpath(Path::new("."))
            .map_err(|e| TransferError::probe_failed(format!("SFTP realpath failed: {}", e)))?;
        Ok(())
    }

    fn disconnect(&self, client: SftpClient) {
        let SftpClient { session, sftp } = client;
        drop(sftp);
        if let Err(e) = session.disconnect(None, "closing", None) {
            debug!("SFTP disconnect from {}: {}", self.describe(), e);
        }
    }

    fn describe(&self) -> String {
        format!("sftp://{}@{}", self.config.username, self.config.address())
    }
}

// ── Error translation ────────────────────────────────────────────────────────

pub(crate) fn is_not_found(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(FX_NO_SUCH_FILE) | ErrorCode::SFTP(FX_NO_SUCH_PATH))
}

/// Failure while sizing or opening: missing files are `RemoteNotFound`,
/// anything else means the remote could not be reached.
pub(crate) fn prepare_error(action: &str, path: &str, e: &ssh2::Error) -> TransferError {
    if is_not_found(e) {
        TransferError::remote_not_found(path)
    } else {
        TransferError::connectivity(format!("SFTP {} failed: {}", action, e)).with_path(path)
    }
}

/// Failure during chunk I/O or close.
pub(crate) fn stream_error(action: &str, path: &str, e: impl std::fmt::Display) -> TransferError {
    TransferError::remote_io(format!("SFTP {} failed: {}", action, e)).with_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfer_engine::TransferErrorKind;

    #[test]
    fn no_such_file_is_not_found() {
        let e = ssh2::Error::new(ErrorCode::SFTP(FX_NO_SUCH_FILE), "no such file");
        let err = prepare_error("stat", "/data/x.bin", &e);
        assert_eq!(err.kind, TransferErrorKind::RemoteNotFound);
        assert_eq!(err.path.as_deref(), Some("/data/x.bin"));
    }

    #[test]
    fn other_prepare_failures_are_connectivity() {
        let e = ssh2::Error::new(ErrorCode::Session(-7), "socket send");
        assert_eq!(
            prepare_error("open", "/x", &e).kind,
            TransferErrorKind::Connectivity
        );
        let denied = ssh2::Error::new(ErrorCode::SFTP(3), "permission denied");
        assert!(!is_not_found(&denied));
    }

    #[test]
    fn stream_failures_are_remote_io() {
        let err = stream_error("read", "/x", "connection reset");
        assert_eq!(err.kind, TransferErrorKind::RemoteIo);
        assert!(err.is_retryable());
    }

    #[test]
    fn connector_rejects_invalid_config() {
        assert!(SftpConnector::new(SftpConnectionConfig::new("", "u")).is_err());
        let c = SftpConnector::new(SftpConnectionConfig::new("h", "u")).unwrap();
        assert_eq!(c.describe(), "sftp://u@h:22");
    }
}
