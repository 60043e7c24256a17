//! # xfer
//!
//! Resumable large-file transfers over pooled remote connections.
//!
//!   • [`TransferEngine`] decides fresh vs. resume from observed sizes and
//!     streams chunks through any [`Transport`]
//!   • [`ConnectionPool`] hands out connections and keeps idle ones alive
//!   • `sftp` / `ftp` modules (cargo features of the same names) bind the
//!     engine to real protocol clients
//!
//! ```no_run
//! # #[cfg(feature = "sftp")]
//! # fn demo() -> xfer::TransferResult<()> {
//! use std::sync::Arc;
//! use xfer::sftp::{SftpConnectionConfig, SftpConnector};
//! use xfer::{ConnectionPool, FileLockStore, PoolConfig, TransferDescriptor};
//!
//! let connector = SftpConnector::new(
//!     SftpConnectionConfig::new("files.example.org", "backup").with_password("secret"),
//! )?;
//! let pool = ConnectionPool::new(connector, PoolConfig::default())?;
//! let descriptor = TransferDescriptor::new("/srv/images/disk.img", "/var/tmp/disk.img");
//! let mut engine = xfer::sftp::download(&pool, descriptor, Arc::new(FileLockStore::new()))?;
//! engine.run()?;
//! # Ok(())
//! # }
//! ```

pub use xfer_engine::*;
pub use xfer_pool::*;

#[cfg(feature = "sftp")]
pub mod sftp {
    use std::sync::Arc;
    use xfer_engine::{LockStore, TransferDescriptor, TransferEngine, TransferResult};
    use xfer_pool::ConnectionPool;

    pub use xfer_sftp::*;

    /// Engine downloading `descriptor.remote_path` over a session from `pool`.
    pub fn download(
        pool: &ConnectionPool<SftpConnector>,
        descriptor: TransferDescriptor,
        locks: Arc<dyn LockStore>,
    ) -> TransferResult<TransferEngine<SftpDownload>> {
        let transport = SftpDownload::acquire(pool, descriptor.remote_path.clone())?;
        TransferEngine::new(transport, descriptor, locks)
    }

    pub fn upload(
        pool: &ConnectionPool<SftpConnector>,
        descriptor: TransferDescriptor,
        locks: Arc<dyn LockStore>,
    ) -> TransferResult<TransferEngine<SftpUpload>> {
        let transport = SftpUpload::acquire(pool, descriptor.remote_path.clone())?;
        TransferEngine::new(transport, descriptor, locks)
    }
}

#[cfg(feature = "ftp")]
pub mod ftp {
    use std::sync::Arc;
    use xfer_engine::{LockStore, TransferDescriptor, TransferEngine, TransferResult};
    use xfer_pool::ConnectionPool;

    pub use xfer_ftp::*;

    pub fn download(
        pool: &ConnectionPool<FtpConnector>,
        descriptor: TransferDescriptor,
        locks: Arc<dyn LockStore>,
    ) -> TransferResult<TransferEngine<FtpDownload>> {
        let transport = FtpDownload::acquire(pool, descriptor.remote_path.clone())?;
        TransferEngine::new(transport, descriptor, locks)
    }

    pub fn upload(
        pool: &ConnectionPool<FtpConnector>,
        descriptor: TransferDescriptor,
        locks: Arc<dyn LockStore>,
    ) -> TransferResult<TransferEngine<FtpUpload>> {
        let transport = FtpUpload::acquire(pool, descriptor.remote_path.clone())?;
        TransferEngine::new(transport, descriptor, locks)
    }
}
