//! Sliding-window failure counter.
//!
//! A rotating ring of `count` buckets, one per `interval` seconds, that
//! supports adding counts to the current bucket and summing the most recent
//! `n` buckets. Used by [`crate::fuse::FuseClient`] to decide when enough
//! failures have accumulated to trip the circuit.
//!
//! All operations take one mutex and never suspend — there is no async
//! runtime dependency in the *locking* here on purpose; advancing the ring
//! and summing a slice of `u64`s is cheap enough that holding a synchronous
//! lock for the duration is the right call, the same way the original C++
//! counter took a plain `std::mutex` rather than anything fancier. The
//! clock itself is `tokio::time::Instant` rather than `std::time::Instant`
//! purely so tests can exercise multi-minute rollover scenarios under
//! `tokio::time::pause`/`advance` instead of sleeping in wall-clock time.

use std::sync::{Mutex, OnceLock};
use tokio::time::Instant;

/// A fixed reference point bucket numbers are computed relative to. Lazily
/// latched on first use so it can fall inside a paused-clock test runtime.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn current_bucket(interval_secs: u64) -> i64 {
    let elapsed = Instant::now().saturating_duration_since(epoch());
    (elapsed.as_secs() / interval_secs) as i64
}

struct TimerCounterState {
    data: Vec<u64>,
    current: usize,
    last: i64,
}

/// Rotating ring of counters over a sliding time window.
pub struct TimerCounter {
    interval_secs: u64,
    state: Mutex<TimerCounterState>,
}

impl TimerCounter {
    /// Create a new counter with `count` buckets, each `interval` seconds
    /// wide.
    ///
    /// # Panics
    ///
    /// Panics if `interval` or `count` is zero — a zero-width or zero-bucket
    /// counter is a programmer error, not a runtime condition to recover
    /// from (spec §7).
    pub fn new(interval_secs: u64, count: usize) -> Self {
        assert!(interval_secs > 0, "TimerCounter interval must be non-zero");
        assert!(count > 0, "TimerCounter bucket count must be non-zero");
        Self {
            interval_secs,
            state: Mutex::new(TimerCounterState {
                data: vec![0; count],
                current: 0,
                last: current_bucket(interval_secs),
            }),
        }
    }

    /// Zero all buckets.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.data.iter_mut().for_each(|slot| *slot = 0);
    }

    /// Advance the ring to the current time bucket, then add `c` to the
    /// current bucket.
    pub fn add_count(&self, c: u64) {
        let mut state = self.state.lock().unwrap();
        self.advance(&mut state);
        let idx = state.current;
        state.data[idx] += c;
    }

    /// Advance the ring, then return the sum of the most recent
    /// `min(n, count)` buckets, inclusive of the current one.
    pub fn sum_of_last(&self, n: usize) -> u64 {
        let mut state = self.state.lock().unwrap();
        self.advance(&mut state);

        if n == 0 {
            return 0;
        }

        let len = state.data.len();
        if n >= len {
            return state.data.iter().sum();
        }

        let mut sum = 0u64;
        let mut pos = state.current;
        for _ in 0..n {
            sum += state.data[pos];
            pos = (pos + len - 1) % len;
        }
        sum
    }

    /// Advance the write index to the current time bucket, zeroing every
    /// newly-entered bucket along the way. `delta < 0` (a clock regression)
    /// is impossible on a monotonic clock; if observed anyway, it is
    /// treated as `delta = 0`.
    fn advance(&self, state: &mut TimerCounterState) {
        let now_bucket = current_bucket(self.interval_secs);
        let delta = (now_bucket - state.last).max(0);
        let len = state.data.len() as i64;

        if delta >= len {
            state.data.iter_mut().for_each(|slot| *slot = 0);
        } else {
            for _ in 0..delta {
                state.current = (state.current + 1) % state.data.len();
                state.data[state.current] = 0;
            }
        }
        state.last = now_bucket;
    }
}
