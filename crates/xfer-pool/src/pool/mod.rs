// ── xfer-pool / pool module ───────────────────────────────────────────────────
//
//   • `types`     – pool configuration and statistics
//   • `factory`   – how a pool creates, probes and tears down clients
//   • `manager`   – the pool itself and the checked-out connection guard
//   • `keepalive` – background probe / reap / top-up loop

pub mod types;
pub mod factory;
pub mod manager;
pub mod keepalive;

pub use types::{PoolConfig, PoolStats};
pub use factory::ConnectionFactory;
pub use manager::{ConnectionPool, PooledConnection};
pub use keepalive::HeartCheckReport;
