// ── Types ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use std::time::Duration;
use xfer_engine::{TransferError, TransferResult};

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_max_size() -> usize {
    4
}
fn default_min_idle() -> usize {
    1
}
fn default_acquire_timeout_ms() -> u64 {
    30_000
}
fn default_heart_check_interval_ms() -> u64 {
    30_000
}
fn default_max_idle_ms() -> u64 {
    300_000 // 5 min
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Upper bound on live connections (idle + checked out).
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Idle connections kept warm by the keep-alive pass.
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_heart_check_interval_ms")]
    pub heart_check_interval_ms: u64,
    /// Idle connections unused for longer are closed. `0` = never.
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            min_idle: default_min_idle(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            heart_check_interval_ms: default_heart_check_interval_ms(),
            max_idle_ms: default_max_idle_ms(),
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_heart_check_interval(mut self, interval: Duration) -> Self {
        self.heart_check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle_ms = max_idle.as_millis() as u64;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn heart_check_interval(&self) -> Duration {
        Duration::from_millis(self.heart_check_interval_ms)
    }

    pub fn max_idle(&self) -> Option<Duration> {
        match self.max_idle_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn validate(&self) -> TransferResult<()> {
        if self.max_size == 0 {
            return Err(TransferError::invalid_config("maxSize must be at least 1"));
        }
        if self.min_idle > self.max_size {
            return Err(TransferError::invalid_config(format!(
                "minIdle ({}) exceeds maxSize ({})",
                self.min_idle, self.max_size
            )));
        }
        if self.heart_check_interval_ms == 0 {
            return Err(TransferError::invalid_config(
                "heartCheckIntervalMs must be positive",
            ));
        }
        Ok(())
    }
}

// ── Statistics ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Live connections, including ones being opened or probed.
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections closed because they were broken, invalidated or reaped.
    pub evicted: u64,
    pub probe_failures: u64,
}
