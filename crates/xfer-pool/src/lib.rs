//! # xfer-pool – Connection Pool
//!
//! Bounded pool of remote-client connections shared by transfers:
//!   • Blocking `acquire()` with timeout, RAII return on drop
//!   • `invalidate()` to evict a connection and provision a replacement
//!   • Keep-alive monitor that probes idle connections off-lock and replaces
//!     the ones that fail
//!   • Idle reaping above `minIdle` and top-up back to it

pub mod pool;

pub use pool::*;
