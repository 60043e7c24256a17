//! Transfer error type shared by the engine, the pool and the transports.

use serde::{Deserialize, Serialize};

/// Categorised transfer error.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind:?}] {message}{}", fmt_path(.path))]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
    /// Local or remote path the error relates to, if any.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// Remote unreachable while querying size or opening a handle.
    Connectivity,
    /// The remote file does not exist.
    RemoteNotFound,
    /// Remote read/write/close failed mid-transfer.
    RemoteIo,
    /// Local read/write/create failed.
    LocalIo,
    /// Another transfer holds the lock marker for this file.
    LockContention,
    /// `acquire()` timed out waiting for a free connection.
    PoolExhausted,
    /// The pool was closed.
    PoolClosed,
    /// Keep-alive probe failed (never surfaced to transfer callers).
    ProbeFailed,
    /// Operation not valid in the current engine state.
    InvalidState,
    /// Config / parameter validation error.
    InvalidConfig,
    /// Size or checksum mismatch after a transfer.
    Integrity,
    /// Worker panicked or was cancelled.
    Internal,
}

pub type TransferResult<T> = Result<T, TransferError>;

// ── Construction helpers ─────────────────────────────────────────────

impl TransferError {
    pub fn new(kind: TransferErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Connectivity, msg)
    }

    pub fn remote_not_found(path: &str) -> Self {
        Self::new(
            TransferErrorKind::RemoteNotFound,
            format!("Remote file '{}' not found", path),
        )
        .with_path(path)
    }

    pub fn remote_io(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::RemoteIo, msg)
    }

    pub fn local_io(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::LocalIo, msg)
    }

    pub fn lock_contention(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::LockContention, msg)
    }

    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::PoolExhausted, msg)
    }

    pub fn pool_closed() -> Self {
        Self::new(TransferErrorKind::PoolClosed, "Connection pool is closed")
    }

    pub fn probe_failed(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::ProbeFailed, msg)
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::InvalidState, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::InvalidConfig, msg)
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Integrity, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Internal, msg)
    }

    /// Errors a retry (which re-observes the resume offset) may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            TransferErrorKind::Connectivity
                | TransferErrorKind::RemoteIo
                | TransferErrorKind::PoolExhausted
        )
    }
}

fn fmt_path(path: &Option<String>) -> String {
    match path {
        Some(p) => format!(" ({})", p),
        None => String::new(),
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::connectivity(format!("I/O timeout: {}", e)),
            _ => Self::local_io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        Self::local_io(format!("Lock marker encoding: {}", e))
    }
}

impl From<TransferError> for String {
    fn from(e: TransferError) -> String {
        e.to_string()
    }
}
