use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use xfer::*;

const KIB: usize = 1024;

// ── A pool of sessions onto one in-memory host ───────────────────────────────

struct Session {
    serial: usize,
    remote: MemoryRemote,
}

#[derive(Default)]
struct MemoryHost {
    remote: MemoryRemote,
    next: AtomicUsize,
    dead: Mutex<HashSet<usize>>,
    disconnected: Mutex<Vec<usize>>,
}

impl ConnectionFactory for MemoryHost {
    type Client = Session;

    fn connect(&self) -> TransferResult<Session> {
        Ok(Session {
            serial: self.next.fetch_add(1, Ordering::SeqCst),
            remote: self.remote.clone(),
        })
    }

    fn probe(&self, client: &mut Session) -> TransferResult<()> {
        if self.dead.lock().unwrap().contains(&client.serial) {
            return Err(TransferError::probe_failed("session dropped"));
        }
        Ok(())
    }

    fn disconnect(&self, client: Session) {
        self.disconnected.lock().unwrap().push(client.serial);
    }

    fn describe(&self) -> String {
        "memory://host".to_string()
    }
}

/// Download transport that borrows its session from the pool.
struct PooledDownload {
    conn: Option<PooledConnection<MemoryHost>>,
    inner: MemoryDownload,
}

impl PooledDownload {
    fn acquire(pool: &ConnectionPool<MemoryHost>, path: &str) -> TransferResult<Self> {
        let conn = pool.acquire()?;
        let inner = conn.remote.download(path);
        Ok(Self {
            conn: Some(conn),
            inner,
        })
    }
}

impl Transport for PooledDownload {
    type Handle = <MemoryDownload as Transport>::Handle;

    fn direction(&self) -> TransferDirection {
        self.inner.direction()
    }

    fn remote_path(&self) -> &str {
        self.inner.remote_path()
    }

    fn remote_size(&mut self) -> TransferResult<Option<u64>> {
        self.inner.remote_size()
    }

    fn open_at(&mut self, offset: u64) -> TransferResult<Self::Handle> {
        self.inner.open_at(offset)
    }

    fn transfer_chunk(&mut self, handle: &mut Self::Handle, buf: &mut [u8]) -> TransferResult<usize> {
        self.inner.transfer_chunk(handle, buf).map_err(|e| {
            if let Some(conn) = self.conn.as_mut() {
                conn.mark_broken();
            }
            e
        })
    }

    fn close_handle(&mut self, handle: Self::Handle) -> TransferResult<()> {
        self.inner.close_handle(handle)
    }

    fn release(&mut self) {
        self.conn.take();
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

// ── Scenario 5 ───────────────────────────────────────────────────────────────

#[test]
fn third_acquire_waits_for_a_release() {
    let config = PoolConfig::default()
        .with_max_size(2)
        .with_min_idle(0)
        .with_heart_check_interval(Duration::from_secs(3600));
    let pool = Arc::new(ConnectionPool::new(MemoryHost::default(), config).unwrap());

    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    assert_eq!(pool.stats().in_use, 2);

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let got = pool.acquire_timeout(Duration::from_secs(5)).map(|c| c.serial);
            tx.send(got).unwrap();
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    let released = first.serial;
    pool.release(first);

    let got = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(got, released);
    waiter.join().unwrap();

    let stats = pool.stats();
    assert_eq!(stats.created, 2);
    assert!(stats.total <= 2);
    drop(second);
    pool.close();
}

#[test]
fn exhausted_pool_is_a_retryable_error() {
    let config = PoolConfig::default()
        .with_max_size(1)
        .with_min_idle(0)
        .with_acquire_timeout(Duration::from_millis(50))
        .with_heart_check_interval(Duration::from_secs(3600));
    let pool = ConnectionPool::new(MemoryHost::default(), config).unwrap();

    let held = pool.acquire().unwrap();
    let err = PooledDownload::acquire(&pool, "/x").err().unwrap();
    assert_eq!(err.kind, TransferErrorKind::PoolExhausted);
    assert!(err.is_retryable());
    drop(held);
    assert!(PooledDownload::acquire(&pool, "/x").is_ok());
}

// ── Scenario 6 ───────────────────────────────────────────────────────────────

#[test]
fn keepalive_replaces_idle_session_during_transfer() {
    let host = MemoryHost::default();
    let data = pattern(640 * KIB);
    host.remote.put("/srv/data.bin", data.clone());
    // Keep the transfer running across several keep-alive passes.
    host.remote.on_chunk(|_| thread::sleep(Duration::from_millis(5)));

    let config = PoolConfig::default()
        .with_max_size(2)
        .with_min_idle(2)
        .with_heart_check_interval(Duration::from_millis(20));
    let pool = Arc::new(ConnectionPool::new(host, config).unwrap());
    assert_eq!(pool.stats().idle, 2);

    let transport = PooledDownload::acquire(&pool, "/srv/data.bin").unwrap();
    let busy = transport.conn.as_ref().map(|c| c.serial).unwrap();
    let idle = 1 - busy;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("data.bin");
    let desc = TransferDescriptor::new("/srv/data.bin", &local).with_chunk_size(8 * KIB);
    let mut engine = TransferEngine::new(transport, desc, Arc::new(MemoryLockStore::new())).unwrap();
    let control = engine.control();
    let runner = thread::spawn(move || {
        let outcome = engine.run();
        engine.close();
        outcome
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while control.phase() != TransferPhase::Running {
        assert!(Instant::now() < deadline, "transfer never started streaming");
        thread::sleep(Duration::from_millis(1));
    }
    pool.factory().dead.lock().unwrap().insert(idle);

    while !pool.factory().disconnected.lock().unwrap().contains(&idle) {
        assert!(Instant::now() < deadline, "dead idle session was never replaced");
        thread::sleep(Duration::from_millis(5));
    }
    // The replacement happened while the transfer was still streaming.
    assert_eq!(control.phase(), TransferPhase::Running);

    match runner.join().unwrap().unwrap() {
        TransferOutcome::Completed(report) => assert_eq!(report.final_size, data.len() as u64),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(fs::read(&local).unwrap(), data);

    let disconnected = pool.factory().disconnected.lock().unwrap().clone();
    assert!(!disconnected.contains(&busy));
    let stats = pool.stats();
    assert_eq!(stats.created, 3);
    assert!(stats.probe_failures >= 1);
    assert_eq!(stats.total, 2);
    pool.close();
}

#[test]
fn failed_transfer_discards_its_session() {
    let host = MemoryHost::default();
    host.remote.put("/flaky.bin", pattern(64 * KIB));
    host.remote.fail_after_bytes(Some(16 * KIB as u64));

    let config = PoolConfig::default()
        .with_max_size(1)
        .with_min_idle(0)
        .with_heart_check_interval(Duration::from_secs(3600));
    let pool = ConnectionPool::new(host, config).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let desc = TransferDescriptor::new("/flaky.bin", dir.path().join("flaky.bin")).with_chunk_size(8 * KIB);
    let transport = PooledDownload::acquire(&pool, "/flaky.bin").unwrap();
    let mut engine = TransferEngine::new(transport, desc, Arc::new(MemoryLockStore::new())).unwrap();

    let err = engine.run().unwrap_err();
    assert_eq!(err.kind, TransferErrorKind::RemoteIo);
    engine.close();

    assert_eq!(*pool.factory().disconnected.lock().unwrap(), vec![0]);
    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.evicted, 1);

    // The slot is free again and a fresh session resumes the transfer.
    let again = PooledDownload::acquire(&pool, "/flaky.bin").unwrap();
    assert_eq!(again.conn.as_ref().map(|c| c.serial), Some(1));
}
