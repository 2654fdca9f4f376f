//! fuse-client: a resilient HTTP client runtime.
//!
//! # Overview
//!
//! Four pieces compose into a client that pools connections per
//! destination, tracks recent failures in a fixed-width sliding window, and
//! trips a circuit breaker ("fuse") that fails fast and recovers itself:
//!
//! - [`connection`]: the [`connection::Connection`] trait and the
//!   pool-owned [`connection::PooledEntry`] wrapper around it.
//! - [`connection_pool`]: [`connection_pool::ConnectionPool`], a
//!   per-destination pool with capacity limits and background idle
//!   reaping.
//! - [`timer_counter`]: [`timer_counter::TimerCounter`], the fixed-width
//!   sliding-window failure counter the fuse trips on.
//! - [`fuse`]: [`fuse::FuseClient`], the breaker state machine and its
//!   recovery worker.
//! - [`http`]: [`http::HttpFuseClient`], the concrete `reqwest`-backed
//!   client wiring the above together into `do_request`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Your Application               │
//! └─────────────┬───────────────────────────┘
//!               │ do_request(path, method, headers, body)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       HttpFuseClient (http)              │  ← attempt loop, trace ids
//! └─────────────┬───────────────────────────┘
//!               │ precheck / record_outcome
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       FuseClient (fuse)                  │  ← breaker state, recovery
//! │  backed by TimerCounter (timer_counter)  │     worker
//! └─────────────┬───────────────────────────┘
//!               │ acquire / release
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       ConnectionPool (connection_pool)   │  ← per-destination reuse
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External Service
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use fuse_client::prelude::*;
//! use reqwest::header::HeaderMap;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), FuseError> {
//! let factory = HttpConnectionFactory::new()?;
//! let pool = Arc::new(ConnectionPool::new(Arc::new(factory), PoolConfig::default()));
//! let client = HttpFuseClient::new("example.com:443", pool, "/health");
//! client.apply_config(&FuseConfig {
//!     slide_window: 60,
//!     threshold: 10,
//!     recovery_interval_secs: 5,
//!     recovery_threshold: 3,
//!     ..Default::default()
//! });
//!
//! let mut headers = HeaderMap::new();
//! let mut response = Vec::new();
//! let status = client
//!     .do_request("/status", HttpMethod::Get, &mut headers, &Body::Json(Vec::new()), &mut response)
//!     .await;
//! # let _ = status;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod fuse;
pub mod http;
pub mod timer_counter;

pub use connection::{Connection, PooledEntry};
pub use connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig, PooledConnection};
pub use error::FuseError;
pub use fuse::{FuseClient, FuseGate, RecoveryProbe};
pub use http::{Body, FormPart, FuseConfig, HttpConnection, HttpConnectionFactory, HttpFuseClient, HttpMethod, Outcome};
pub use timer_counter::TimerCounter;

/// Convenient glob import of the crate's main types.
///
/// # Example
/// ```
/// use fuse_client::prelude::*;
/// ```
pub mod prelude {
    pub use super::connection::Connection;
    pub use super::connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig};
    pub use super::error::FuseError;
    pub use super::fuse::{FuseClient, RecoveryProbe};
    pub use super::http::{Body, FuseConfig, HttpConnectionFactory, HttpFuseClient, HttpMethod};
}
