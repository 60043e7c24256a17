//! Bounded connection pool.
//!
//! The idle queue behind one `Mutex` is the only mutation point. Every
//! network call (connect, probe, disconnect) happens with the lock released;
//! a connection being opened or probed still counts toward `max_size`, so
//! capacity can never be exceeded while the lock is dropped.

use crate::pool::factory::ConnectionFactory;
use crate::pool::keepalive::{self, HeartCheckReport, KeepAlive};
use crate::pool::types::{PoolConfig, PoolStats};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;
use xfer_engine::{TransferError, TransferResult};

// ── Shared state ─────────────────────────────────────────────────────────────

pub(crate) struct IdleEntry<C> {
    pub(crate) id: String,
    pub(crate) client: C,
    pub(crate) last_used: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleEntry<C>>,
    /// Idle + checked out + being opened/probed.
    total: usize,
    closed: bool,
    created: u64,
    evicted: u64,
    probe_failures: u64,
}

pub(crate) struct Shared<F: ConnectionFactory> {
    pub(crate) factory: F,
    pub(crate) config: PoolConfig,
    state: Mutex<PoolState<F::Client>>,
    available: Condvar,
}

impl<F: ConnectionFactory> Shared<F> {
    fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                closed: false,
                created: 0,
                evicted: 0,
                probe_failures: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<F::Client>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a slot, then connect with the lock released.
    /// `Ok(None)` when the pool is full or closed.
    fn open_slot(&self) -> TransferResult<Option<(String, F::Client)>> {
        {
            let mut state = self.lock();
            if state.closed || state.total >= self.config.max_size {
                return Ok(None);
            }
            state.total += 1;
        }
        match self.factory.connect() {
            Ok(client) => {
                let id = Uuid::new_v4().to_string();
                self.lock().created += 1;
                debug!("pool: opened connection {} to {}", id, self.factory.describe());
                Ok(Some((id, client)))
            }
            Err(e) => {
                {
                    let mut state = self.lock();
                    state.total = state.total.saturating_sub(1);
                }
                self.available.notify_one();
                Err(e)
            }
        }
    }

    /// Return a client to the idle queue; torn down instead once closed.
    pub(crate) fn checkin(&self, entry: IdleEntry<F::Client>) {
        let mut state = self.lock();
        if state.closed {
            state.total = state.total.saturating_sub(1);
            drop(state);
            self.factory.disconnect(entry.client);
            return;
        }
        state.idle.push_back(entry);
        drop(state);
        self.available.notify_one();
    }

    pub(crate) fn evict(&self, id: &str, client: F::Client, probe_failure: bool) {
        {
            let mut state = self.lock();
            state.total = state.total.saturating_sub(1);
            state.evicted += 1;
            if probe_failure {
                state.probe_failures += 1;
            }
        }
        self.available.notify_one();
        debug!("pool: evicted connection {}", id);
        self.factory.disconnect(client);
    }

    /// Open one more idle client if there is room. Returns whether one was added.
    pub(crate) fn add_client(&self) -> TransferResult<bool> {
        match self.open_slot()? {
            Some((id, client)) => {
                self.checkin(IdleEntry {
                    id,
                    client,
                    last_used: Instant::now(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn take_idle_front(&self) -> Option<IdleEntry<F::Client>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.idle.pop_front()
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub(crate) fn needs_top_up(&self) -> bool {
        let state = self.lock();
        !state.closed && state.idle.len() < self.config.min_idle && state.total < self.config.max_size
    }

    /// Close idle connections unused for longer than `max_idle`, never going
    /// below `min_idle`. Returns how many were closed.
    pub(crate) fn reap_idle(&self) -> usize {
        let max_idle = match self.config.max_idle() {
            Some(d) => d,
            None => return 0,
        };
        let expired: Vec<IdleEntry<F::Client>> = {
            let mut state = self.lock();
            let mut remaining = state.idle.len();
            let mut keep = VecDeque::with_capacity(remaining);
            let mut expired = Vec::new();
            while let Some(entry) = state.idle.pop_front() {
                if remaining > self.config.min_idle && entry.last_used.elapsed() >= max_idle {
                    remaining -= 1;
                    expired.push(entry);
                } else {
                    keep.push_back(entry);
                }
            }
            state.idle = keep;
            state.total = state.total.saturating_sub(expired.len());
            state.evicted += expired.len() as u64;
            expired
        };
        let count = expired.len();
        for entry in expired {
            self.factory.disconnect(entry.client);
        }
        if count > 0 {
            info!("pool: reaped {} idle connections", count);
        }
        count
    }

    /// Mark closed and hand back the idle connections. `None` if already closed.
    fn shutdown(&self) -> Option<Vec<IdleEntry<F::Client>>> {
        let drained: Vec<_> = {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        self.available.notify_all();
        Some(drained)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            in_use: state.total.saturating_sub(state.idle.len()),
            max_size: self.config.max_size,
            created: state.created,
            evicted: state.evicted,
            probe_failures: state.probe_failures,
        }
    }
}

// ── Pool ─────────────────────────────────────────────────────────────────────

/// Explicitly owned pool of clients produced by `F`. The keep-alive monitor
/// starts with the pool and stops in [`close`](Self::close) (or on drop).
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    keepalive: Mutex<Option<KeepAlive>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> TransferResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(factory, config));

        for _ in 0..shared.config.min_idle {
            if let Err(e) = shared.add_client() {
                warn!(
                    "pool: warm-up connection to {} failed: {}",
                    shared.factory.describe(),
                    e
                );
                break;
            }
        }

        let keepalive = KeepAlive::spawn(Arc::clone(&shared))?;
        info!(
            "pool: ready for {} (max {}, min idle {}, heart check every {:?})",
            shared.factory.describe(),
            shared.config.max_size,
            shared.config.min_idle,
            shared.config.heart_check_interval()
        );
        Ok(Self {
            shared,
            keepalive: Mutex::new(Some(keepalive)),
        })
    }

    /// Check out a connection, waiting up to `acquireTimeoutMs`.
    pub fn acquire(&self) -> TransferResult<PooledConnection<F>> {
        self.acquire_timeout(self.shared.config.acquire_timeout())
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> TransferResult<PooledConnection<F>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return Err(TransferError::pool_closed());
            }
            if let Some(entry) = state.idle.pop_back() {
                drop(state);
                return Ok(PooledConnection::new(entry.id, entry.client, &self.shared));
            }
            if state.total < self.shared.config.max_size {
                drop(state);
                match self.shared.open_slot()? {
                    Some((id, client)) => return Ok(PooledConnection::new(id, client, &self.shared)),
                    None => {
                        state = self.shared.lock();
                        continue;
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransferError::pool_exhausted(format!(
                    "No connection to {} available within {:?} (max {})",
                    self.shared.factory.describe(),
                    timeout,
                    self.shared.config.max_size
                )));
            }
            let (guard, _) = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Hand a connection back. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection<F>) {
        drop(conn);
    }

    /// Evict a connection and provision a replacement.
    pub fn invalidate(&self, mut conn: PooledConnection<F>) {
        conn.mark_broken();
        let id = conn.id().to_string();
        drop(conn);
        match self.shared.add_client() {
            Ok(_) => debug!("pool: replaced connection {}", id),
            Err(e) => warn!("pool: replacement for connection {} failed: {}", id, e),
        }
    }

    /// Open a fresh idle connection if below capacity.
    pub fn add_client(&self) -> TransferResult<bool> {
        if self.shared.is_closed() {
            return Err(TransferError::pool_closed());
        }
        self.shared.add_client()
    }

    /// Run one keep-alive pass now, on the calling thread.
    pub fn heart_check(&self) -> HeartCheckReport {
        keepalive::heart_check(&*self.shared, &|| true)
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop the keep-alive monitor and close idle connections. Checked-out
    /// connections are closed when they come back. Idempotent.
    pub fn close(&self) {
        let keepalive = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(keepalive) = keepalive {
            keepalive.stop();
        }
        if let Some(drained) = self.shared.shutdown() {
            let count = drained.len();
            for entry in drained {
                self.shared.factory.disconnect(entry.client);
            }
            info!(
                "pool: closed {} ({} idle connections dropped)",
                self.shared.factory.describe(),
                count
            );
        }
    }
}

impl<F: ConnectionFactory> Drop for ConnectionPool<F> {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Checked-out connection ───────────────────────────────────────────────────

/// A client checked out of a pool. Dropping it returns the client, unless it
/// was marked broken, in which case the client is closed and its slot freed.
pub struct PooledConnection<F: ConnectionFactory> {
    id: String,
    client: Option<F::Client>,
    last_used: Instant,
    healthy: bool,
    shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(id: String, client: F::Client, shared: &Arc<Shared<F>>) -> Self {
        Self {
            id,
            client: Some(client),
            last_used: Instant::now(),
            healthy: true,
            shared: Arc::clone(shared),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Discard instead of returning to the pool on drop.
    pub fn mark_broken(&mut self) {
        if self.healthy {
            debug!("pool: connection {} marked broken", self.id);
        }
        self.healthy = false;
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Client;

    fn deref(&self) -> &F::Client {
        match &self.client {
            Some(client) => client,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut F::Client {
        self.last_used = Instant::now();
        match &mut self.client {
            Some(client) => client,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if self.healthy {
                self.shared.checkin(IdleEntry {
                    id: std::mem::take(&mut self.id),
                    client,
                    last_used: Instant::now(),
                });
            } else {
                self.shared.evict(&self.id, client, false);
            }
        }
    }
}
