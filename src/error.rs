//! Error types for the resilient client runtime.
//!
//! `do_request` itself never returns a `Result` — per its contract (see the
//! crate's top-level docs) it returns an HTTP status code, `0`, or `-1`, and
//! an empty/partial response body stands in for "no body available". This
//! module covers everything *beneath* that contract: pool exhaustion,
//! missing factories, and connection lifecycle failures. The attempt loop's
//! own retry/outcome classification (success vs. client error vs. retry) is
//! a separate, live concern covered by [`crate::http::Outcome`], not by this
//! type.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the pool and fuse machinery below `do_request`'s
/// status-code convention.
#[derive(Debug, Error, Clone)]
pub enum FuseError {
    /// The pool has no connection factory installed.
    #[error("no connection factory installed for this pool")]
    NoConnectionFactory,

    /// The pool could not produce a connection before the caller's timeout.
    #[error("connection pool exhausted for destination {0}")]
    PoolExhausted(String),

    /// The pool has been shut down and rejects new acquisitions.
    #[error("connection pool is shut down")]
    Shutdown,

    /// Releasing a connection the pool does not track as busy.
    #[error("connection not tracked as busy for destination {0}")]
    UnknownConnection(String),

    /// The connection factory failed to produce a connection.
    #[error("failed to create connection: {0}")]
    ConnectionCreation(String),

    /// A wait exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}
