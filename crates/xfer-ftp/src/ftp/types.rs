// ── Types ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use std::time::Duration;
use xfer_engine::{TransferError, TransferResult};

fn default_ftp_port() -> u16 {
    21
}
fn default_username() -> String {
    "anonymous".to_string()
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_data_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FtpConnectionConfig {
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// PASV data connections (the usual choice behind NAT).
    #[serde(default = "default_true")]
    pub passive: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Read/write timeout on the control socket.
    #[serde(default = "default_data_timeout_secs")]
    pub data_timeout_secs: u64,
}

impl FtpConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ftp_port(),
            username: default_username(),
            password: None,
            passive: true,
            connect_timeout_secs: default_connect_timeout_secs(),
            data_timeout_secs: default_data_timeout_secs(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = Some(password.into());
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }

    /// Anonymous logins conventionally send an e-mail-ish password.
    pub fn login_password(&self) -> &str {
        match &self.password {
            Some(p) => p,
            None if self.username == "anonymous" => "anonymous@",
            None => "",
        }
    }

    pub fn validate(&self) -> TransferResult<()> {
        if self.host.trim().is_empty() {
            return Err(TransferError::invalid_config("FTP host must not be empty"));
        }
        if self.connect_timeout_secs == 0 || self.data_timeout_secs == 0 {
            return Err(TransferError::invalid_config("FTP timeouts must be positive"));
        }
        Ok(())
    }
}
