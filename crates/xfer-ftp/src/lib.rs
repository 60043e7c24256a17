//! # xfer-ftp – FTP Transports
//!
//! suppaftp-backed pieces for the transfer engine:
//!   • `FtpConnector`: pool connection factory (connect, login, binary mode,
//!     NOOP probe)
//!   • `FtpDownload` / `FtpUpload`: REST/RETR and STOR/APPE data streams
//!     over a pooled control connection

pub mod ftp;

pub use ftp::*;
