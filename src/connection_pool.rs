//! Per-destination connection pool: acquire/release, capacity limits, and
//! background idle reaping.
//!
//! Generalizes the teacher's flat, semaphore-gated pool
//! (`core-resilience::connection_pool::ConnectionPool<T>`) into the
//! per-destination shape the original source actually uses —
//! `unordered_map<string, Connections>` for both the idle and busy sets,
//! guarded by one mutex and a condition variable. Tokio has no condvar, so
//! `tokio::sync::Notify` plays that role: a waiter registers interest with
//! `notify.notified()` *before* re-checking the predicate under the lock,
//! which is the standard pattern for avoiding the missed-wakeup race a
//! naive "check then await" would have.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::connection::PooledEntry;
use crate::error::FuseError;

/// Produces fresh connections for a destination on demand. Stateless from
/// the pool's perspective — a factory is never asked to validate or close
/// a connection; that is a transport-specific concern left to `Connection`
/// itself via `disconnect`.
#[async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    async fn create(&self, destination: &str) -> Result<T, FuseError>;
}

/// Pool configuration. `max_connections = 0` means unbounded.
///
/// Not `serde::Deserialize` itself (its `Duration` fields have no built-in
/// serde mapping without a `with =` shim); `FuseConfig` in `http` is the
/// config surface meant for deserialization and expresses its durations as
/// plain seconds/milliseconds for that reason.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub clean_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            idle_timeout: Duration::from_secs(60),
            clean_interval: Duration::from_secs(60),
        }
    }
}

/// How long `acquire` is willing to wait, mirroring the original's signed
/// `timeout` parameter: negative blocks indefinitely, zero tries once,
/// positive bounds the wait.
fn timeout_from_secs(timeout_secs: i64) -> Option<Duration> {
    if timeout_secs < 0 {
        None
    } else {
        Some(Duration::from_secs(timeout_secs as u64))
    }
}

/// A connection on loan from the pool. Carries enough identity
/// (`destination`, the entry's stable id) for `release` to find and move it
/// back without a second lookup.
pub struct PooledConnection<T> {
    destination: String,
    entry: PooledEntry<T>,
}

impl<T> PooledConnection<T> {
    pub fn get(&self) -> &T {
        self.entry.conn()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.entry.conn_mut()
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn into_inner(self) -> T {
        self.entry.into_inner()
    }
}

struct PoolState<T> {
    idle: HashMap<String, VecDeque<PooledEntry<T>>>,
    busy_ids: HashMap<String, HashSet<u64>>,
    reserved: HashMap<String, usize>,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        Self {
            idle: HashMap::new(),
            busy_ids: HashMap::new(),
            reserved: HashMap::new(),
        }
    }

    fn total(&self, destination: &str) -> usize {
        self.idle.get(destination).map_or(0, VecDeque::len)
            + self.busy_ids.get(destination).map_or(0, HashSet::len)
            + self.reserved.get(destination).copied().unwrap_or(0)
    }
}

/// A per-destination pool of reusable connections.
///
/// `idle[dest]` and `busy[dest]` (via `busy_ids`) are disjoint by
/// construction: an entry only ever exists in one or the other, moved
/// atomically under the pool mutex.
pub struct ConnectionPool<T: Send + 'static> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<T>>,
    state: Arc<Mutex<PoolState<T>>>,
    notify: Arc<Notify>,
    stop: Arc<AtomicBool>,
    reaper: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Construct the pool and start its background reaper.
    ///
    /// # Panics
    ///
    /// Panics if `idle_timeout` or `clean_interval` is zero (§7: fatal,
    /// programmer-error construction conditions).
    pub fn new(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig) -> Self {
        assert!(!config.idle_timeout.is_zero(), "idle_timeout must be non-zero");
        assert!(!config.clean_interval.is_zero(), "clean_interval must be non-zero");

        let state = Arc::new(Mutex::new(PoolState::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let reaper = tokio::spawn(reap(state.clone(), stop.clone(), config.clean_interval));

        Self {
            config,
            factory,
            state,
            notify: Arc::new(Notify::new()),
            stop,
            reaper: Some(reaper),
        }
    }

    /// Acquire a connection for `destination`.
    ///
    /// `timeout_secs < 0` blocks indefinitely; `== 0` tries exactly once;
    /// `> 0` bounds the wait to that many seconds.
    pub async fn acquire(
        &self,
        destination: &str,
        timeout_secs: i64,
    ) -> Result<PooledConnection<T>, FuseError> {
        let deadline = timeout_from_secs(timeout_secs).map(|d| Instant::now() + d);
        let try_once = timeout_secs == 0;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Err(FuseError::Shutdown);
            }

            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().await;

                if let Some(idle) = state.idle.get_mut(destination) {
                    if let Some(pos) = idle.iter().position(|e| !e.is_expired()) {
                        let entry = idle.remove(pos).unwrap();
                        state
                            .busy_ids
                            .entry(destination.to_string())
                            .or_default()
                            .insert(entry.id());
                        return Ok(PooledConnection {
                            destination: destination.to_string(),
                            entry,
                        });
                    }
                }

                let has_capacity =
                    self.config.max_connections == 0 || state.total(destination) < self.config.max_connections;

                if has_capacity {
                    *state.reserved.entry(destination.to_string()).or_insert(0) += 1;
                } else if try_once {
                    return Err(FuseError::PoolExhausted(destination.to_string()));
                } else {
                    drop(state);
                    match deadline {
                        None => notified.await,
                        Some(dl) => {
                            let remaining = dl.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                return Err(FuseError::Timeout(
                                    Duration::from_secs(timeout_secs.max(0) as u64),
                                ));
                            }
                            if tokio::time::timeout(remaining, notified).await.is_err() {
                                return Err(FuseError::Timeout(Duration::from_secs(
                                    timeout_secs.max(0) as u64,
                                )));
                            }
                        }
                    }
                    continue;
                }
            }

            let created = self.factory.create(destination).await;

            let mut state = self.state.lock().await;
            if let Some(count) = state.reserved.get_mut(destination) {
                *count = count.saturating_sub(1);
            }

            match created {
                Ok(conn) => {
                    let entry = PooledEntry::new(conn, self.config.idle_timeout);
                    state
                        .busy_ids
                        .entry(destination.to_string())
                        .or_default()
                        .insert(entry.id());
                    return Ok(PooledConnection {
                        destination: destination.to_string(),
                        entry,
                    });
                }
                Err(e) => {
                    drop(state);
                    self.notify.notify_one();
                    return Err(e);
                }
            }
        }
    }

    /// Return a connection to the idle set for its destination, stamping
    /// its `last_used_at` and waking one waiter.
    pub async fn release(&self, handle: PooledConnection<T>) -> Result<(), FuseError> {
        let PooledConnection {
            destination,
            mut entry,
        } = handle;

        let mut state = self.state.lock().await;

        let tracked = state
            .busy_ids
            .get(&destination)
            .map(|ids| ids.contains(&entry.id()))
            .unwrap_or(false);

        if !tracked {
            return Err(FuseError::UnknownConnection(destination));
        }

        state.busy_ids.get_mut(&destination).unwrap().remove(&entry.id());
        entry.touch();
        state.idle.entry(destination).or_default().push_back(entry);
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Snapshot of idle/busy counts for a destination, for tests and
    /// diagnostics.
    pub async fn stats(&self, destination: &str) -> (usize, usize) {
        let state = self.state.lock().await;
        (
            state.idle.get(destination).map_or(0, VecDeque::len),
            state.busy_ids.get(destination).map_or(0, HashSet::len),
        )
    }
}

impl<T: Send + 'static> Drop for ConnectionPool<T> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reaper.take() {
            handle.abort();
        }
    }
}

async fn reap<T: Send + 'static>(
    state: Arc<Mutex<PoolState<T>>>,
    stop: Arc<AtomicBool>,
    clean_interval: Duration,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut elapsed = Duration::ZERO;

    loop {
        ticker.tick().await;
        if stop.load(Ordering::SeqCst) {
            return;
        }

        elapsed += Duration::from_secs(1);
        if elapsed < clean_interval {
            continue;
        }
        elapsed = Duration::ZERO;

        let mut state = state.lock().await;
        state.idle.retain(|_, conns| {
            conns.retain(|entry| !entry.is_expired());
            !conns.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Debug, Clone)]
    struct TestConn(u64);

    struct TestFactory {
        counter: AtomicU64,
        fail: AtomicBool,
    }

    impl TestFactory {
        fn new() -> Self {
            Self {
                counter: AtomicU64::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory<TestConn> for TestFactory {
        async fn create(&self, destination: &str) -> Result<TestConn, FuseError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(FuseError::ConnectionCreation(destination.to_string()));
            }
            Ok(TestConn(self.counter.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }

    #[tokio::test]
    async fn test_acquire_release_reuse() {
        let factory = Arc::new(TestFactory::new());
        let pool = ConnectionPool::new(factory, PoolConfig::default());

        let conn = pool.acquire("h:1", 0).await.unwrap();
        let id = conn.get().0;
        pool.release(conn).await.unwrap();

        let (idle, busy) = pool.stats("h:1").await;
        assert_eq!(idle, 1);
        assert_eq!(busy, 0);

        let conn2 = pool.acquire("h:1", 0).await.unwrap();
        assert_eq!(conn2.get().0, id);
    }

    #[tokio::test]
    async fn test_distinct_destinations_are_independent() {
        let factory = Arc::new(TestFactory::new());
        let pool = ConnectionPool::new(factory, PoolConfig::default());

        let a = pool.acquire("h:1", 0).await.unwrap();
        let b = pool.acquire("h:2", 0).await.unwrap();
        assert_ne!(a.get().0, b.get().0);
    }

    #[tokio::test]
    async fn test_capacity_scenario_5() {
        // spec.md §8 boundary scenario 5.
        let factory = Arc::new(TestFactory::new());
        let pool = Arc::new(ConnectionPool::new(
            factory,
            PoolConfig {
                max_connections: 2,
                ..Default::default()
            },
        ));

        let c1 = pool.acquire("h:1", 0).await.unwrap();
        let c2 = pool.acquire("h:1", 0).await.unwrap();
        let c3 = pool.acquire("h:1", 0).await;
        assert!(matches!(c3, Err(FuseError::PoolExhausted(_))));

        pool.release(c1).await.unwrap();
        let c4 = pool.acquire("h:1", 1).await;
        assert!(c4.is_ok());

        pool.release(c2).await.unwrap();
        pool.release(c4.unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_of_unknown_connection_fails() {
        let factory = Arc::new(TestFactory::new());
        let pool = ConnectionPool::new(factory, PoolConfig::default());

        // A handle the pool never tracked as busy for this destination
        // (released once already) must be rejected, and rejecting it must
        // not mutate the idle/busy sets.
        let conn = pool.acquire("h:1", 0).await.unwrap();
        let entry = PooledEntry::new(conn.entry.conn().clone(), Duration::from_secs(60));
        let stale = PooledConnection {
            destination: "h:1".to_string(),
            entry,
        };
        pool.release(conn).await.unwrap();

        let result = pool.release(stale).await;
        assert!(matches!(result, Err(FuseError::UnknownConnection(_))));

        let (idle, busy) = pool.stats("h:1").await;
        assert_eq!(idle, 1);
        assert_eq!(busy, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_reaping_scenario_6() {
        // spec.md §8 boundary scenario 6.
        let factory = Arc::new(TestFactory::new());
        let pool = ConnectionPool::new(
            factory,
            PoolConfig {
                max_connections: 0,
                idle_timeout: Duration::from_secs(2),
                clean_interval: Duration::from_secs(1),
            },
        );

        let conn = pool.acquire("h:1", 0).await.unwrap();
        let first_id = conn.get().0;
        pool.release(conn).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;

        let (idle, _) = pool.stats("h:1").await;
        assert_eq!(idle, 0);

        let conn = pool.acquire("h:1", 0).await.unwrap();
        assert_ne!(conn.get().0, first_id);
    }

    #[tokio::test]
    async fn test_creation_failure_releases_reserved_capacity() {
        let factory = Arc::new(TestFactory::new());
        factory.fail.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::new(
            factory.clone(),
            PoolConfig {
                max_connections: 1,
                ..Default::default()
            },
        );

        let result = pool.acquire("h:1", 0).await;
        assert!(result.is_err());

        factory.fail.store(false, Ordering::SeqCst);
        let result = pool.acquire("h:1", 0).await;
        assert!(result.is_ok());
    }
}
