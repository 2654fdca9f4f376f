//! The `Connection` trait and the pool-owned wrapper around it.
//!
//! `Connection` mirrors the original's split between a small set of
//! transport hooks (`connect`/`disconnect`) implemented by each transport,
//! and idle-timeout bookkeeping that only the pool touches. In the
//! original that bookkeeping was private state on `Connection` itself,
//! reachable only by its `friend class ConnectionPool`; Rust has no
//! friend-class equivalent, so the bookkeeping moves into a pool-owned
//! wrapper (`PooledEntry<T>`) instead of living on the trait object.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// A transport-level connection.
///
/// Implementors provide the two hooks the pool needs to establish and tear
/// down a connection; everything else (idle tracking, expiry, which
/// destination it belongs to) is the pool's concern, not the connection's.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Establish the underlying transport. Called once, right after the
    /// factory produces the connection.
    async fn connect(&mut self) -> bool;

    /// Tear down the underlying transport. Called when the pool discards
    /// the connection (expired, unhealthy, or on pool shutdown).
    async fn disconnect(&mut self) -> bool;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Pool-owned wrapper around a connection, carrying the bookkeeping the
/// pool needs that the connection itself has no business knowing about.
///
/// `last_used_at` is a `tokio::time::Instant`, not `std::time::Instant`, so
/// `is_expired` observes a paused/advanced runtime clock in tests the same
/// way `timer_counter` and `fuse`'s recovery worker do — otherwise idle
/// expiry would be unobservable under `tokio::time::pause`.
pub struct PooledEntry<T> {
    id: u64,
    conn: T,
    idle_timeout: Duration,
    last_used_at: Instant,
}

impl<T> PooledEntry<T> {
    pub fn new(conn: T, idle_timeout: Duration) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            conn,
            idle_timeout,
            last_used_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conn(&self) -> &T {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut T {
        &mut self.conn
    }

    pub fn into_inner(self) -> T {
        self.conn
    }

    /// Whether this entry has sat idle longer than its timeout allows.
    pub fn is_expired(&self) -> bool {
        self.last_used_at.elapsed() > self.idle_timeout
    }

    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }
}
