// ── Types ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use std::time::Duration;
use xfer_engine::{TransferError, TransferResult};

fn default_sftp_port() -> u16 {
    22
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SftpConnectionConfig {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    #[serde(default)]
    pub use_agent: bool,
    /// TCP connect and per-call session timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl SftpConnectionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_sftp_port(),
            username: username.into(),
            password: None,
            private_key_path: None,
            private_key_passphrase: None,
            use_agent: false,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_private_key(mut self, path: impl Into<String>, passphrase: Option<String>) -> Self {
        self.private_key_path = Some(path.into());
        self.private_key_passphrase = passphrase;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> TransferResult<()> {
        if self.host.trim().is_empty() {
            return Err(TransferError::invalid_config("SFTP host must not be empty"));
        }
        if self.username.trim().is_empty() {
            return Err(TransferError::invalid_config("SFTP username must not be empty"));
        }
        if self.timeout_secs == 0 {
            return Err(TransferError::invalid_config("SFTP timeoutSecs must be positive"));
        }
        Ok(())
    }
}
