//! The capability contract every protocol adapter implements.
//!
//! The engine owns all resume/lock/progress logic; a transport only knows
//! how to size, open, move one chunk, and close on its remote side.

use crate::engine::error::TransferResult;
use crate::engine::types::TransferDirection;

pub trait Transport: Send {
    /// Open remote file, positioned at the offset passed to [`open_at`].
    ///
    /// [`open_at`]: Transport::open_at
    type Handle: Send;

    /// Which side is the source. Downloads read from the handle, uploads
    /// write to it.
    fn direction(&self) -> TransferDirection;

    /// Remote path this transport is bound to (for logs and markers).
    fn remote_path(&self) -> &str;

    /// Current remote size, `None` if the file does not exist.
    fn remote_size(&mut self) -> TransferResult<Option<u64>>;

    /// Open the remote file at `offset`. For uploads, `offset == 0` creates
    /// or truncates the remote file.
    fn open_at(&mut self, offset: u64) -> TransferResult<Self::Handle>;

    /// Move one chunk.
    ///
    /// * Download: fill `buf` from the remote, return bytes read (`0` = EOF).
    /// * Upload: write all of `buf` to the remote, return `buf.len()`.
    fn transfer_chunk(&mut self, handle: &mut Self::Handle, buf: &mut [u8]) -> TransferResult<usize>;

    /// Close the handle, flushing/committing whatever the protocol requires.
    fn close_handle(&mut self, handle: Self::Handle) -> TransferResult<()>;

    /// Release protocol resources (connection back to its pool). Called once
    /// from the engine's `close()`; must tolerate being the last call.
    fn release(&mut self) {}
}
