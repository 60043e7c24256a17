// ── xfer-sftp / sftp module ───────────────────────────────────────────────────
//
//   • `types`    – connection configuration
//   • `client`   – session establishment, auth, probe, error translation
//   • `transfer` – engine transports over a pooled session

pub mod types;
pub mod client;
pub mod transfer;

pub use types::SftpConnectionConfig;
pub use client::{SftpClient, SftpConnector};
pub use transfer::{SftpDownload, SftpUpload};
