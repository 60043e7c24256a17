// ── xfer-ftp / ftp module ─────────────────────────────────────────────────────
//
//   • `types`    – connection configuration
//   • `client`   – control connection setup, probe, error translation
//   • `transfer` – engine transports over a pooled control connection

pub mod types;
pub mod client;
pub mod transfer;

pub use types::FtpConnectionConfig;
pub use client::FtpConnector;
pub use transfer::{FtpDownload, FtpUpload};
