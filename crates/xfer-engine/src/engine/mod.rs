// ── xfer-engine / engine module ───────────────────────────────────────────────
//
// Resumable transfer core shared by every protocol crate:
//   • `types`     – descriptor, options, phases, outcomes
//   • `error`     – categorised transfer error
//   • `lock`      – lock markers (side-file or in-memory) + in-process registry
//   • `progress`  – atomic byte counters and rate computation
//   • `transport` – the four-method capability trait transports implement
//   • `local`     – local file helpers (length, truncate, open at offset)
//   • `runner`    – the transfer engine state machine
//   • `worker`    – tokio `spawn_blocking` wrapper around `run()`
//   • `checksum`  – SHA-256 verification
//   • `memory`    – in-memory remote with fault injection

pub mod types;
pub mod error;
pub mod lock;
pub mod progress;
pub mod transport;
pub mod local;
pub mod runner;
pub mod worker;
pub mod checksum;
pub mod memory;

pub use types::*;
pub use error::{TransferError, TransferErrorKind, TransferResult};
pub use lock::{FileLockStore, LockMarker, LockStatus, LockStore, MemoryLockStore};
pub use progress::{ProgressSampler, ProgressTracker};
pub use transport::Transport;
pub use runner::{TransferControl, TransferEngine};
pub use worker::{spawn_transfer, TransferTask};
pub use memory::{MemoryDownload, MemoryRemote, MemoryUpload};
