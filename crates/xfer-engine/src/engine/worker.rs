// ── Background execution ──────────────────────────────────────────────────────
//
// `run()` is blocking I/O; async callers hand the engine to tokio's blocking
// pool and keep a control handle for abort/progress.

use crate::engine::error::{TransferError, TransferResult};
use crate::engine::runner::{TransferControl, TransferEngine};
use crate::engine::transport::Transport;
use crate::engine::types::{ProgressSnapshot, TransferOutcome};
use log::debug;
use tokio::task::JoinHandle;

pub struct TransferTask<T: Transport + 'static> {
    control: TransferControl,
    handle: JoinHandle<(TransferEngine<T>, TransferResult<TransferOutcome>)>,
}

/// Run `engine` on the blocking pool. Must be called inside a tokio runtime.
pub fn spawn_transfer<T: Transport + 'static>(mut engine: TransferEngine<T>) -> TransferTask<T> {
    let control = engine.control();
    debug!("transfer {}: spawning on blocking pool", control.id());
    let handle = tokio::task::spawn_blocking(move || {
        let result = engine.run();
        (engine, result)
    });
    TransferTask { control, handle }
}

impl<T: Transport + 'static> TransferTask<T> {
    pub fn control(&self) -> TransferControl {
        self.control.clone()
    }

    pub fn abort(&self) {
        self.control.abort();
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.control.progress()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run to end. The engine comes back so it can be resumed
    /// or closed by the caller.
    pub async fn join(self) -> TransferResult<(TransferEngine<T>, TransferOutcome)> {
        let (engine, result) = self
            .handle
            .await
            .map_err(|e| TransferError::internal(format!("transfer worker panicked: {}", e)))?;
        result.map(|outcome| (engine, outcome))
    }

    /// Like [`join`](Self::join) but keeps the engine on failure too.
    pub async fn join_with_engine(self) -> TransferResult<(TransferEngine<T>, TransferResult<TransferOutcome>)> {
        self.handle
            .await
            .map_err(|e| TransferError::internal(format!("transfer worker panicked: {}", e)))
    }
}
