//! # xfer-sftp – SFTP Transports
//!
//! ssh2-backed pieces for the transfer engine:
//!   • `SftpConnector`: pool connection factory (TCP, handshake, agent /
//!     key / password auth, keep-alive probe)
//!   • `SftpDownload` / `SftpUpload`: positioned remote reads and writes
//!     over a pooled session

pub mod sftp;

pub use sftp::*;
