//! Exponential backoff and cooperative cancellation for the deadlock
//! retry loop: delay is a pure function of retry count.
//!
//! The `goto retry`-style control flow in back-bdb is expressed here as
//! an explicit loop in [`crate::orchestrator::WriteOrchestrator`]; this
//! module supplies the two pure/impure halves that loop needs: a pure
//! delay calculation, and a cancellation flag checked at each retry
//! boundary rather than mid-transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;

/// Per-operation context threaded through a write call: the abandon flag
/// a caller can flip to cancel a retrying operation between attempts.
/// Grounded in strata-concurrency's cancellation tokens, generalized to a
/// single boolean (no partial-cancellation states).
#[derive(Default)]
pub struct OpContext {
    abandoned: AtomicBool,
}

impl OpContext {
    /// A fresh context, not abandoned.
    pub fn new() -> Self {
        OpContext::default()
    }

    /// Signal that the caller has cancelled this operation. Observed at
    /// the next retry boundary, not mid-transaction: operations within a
    /// single transaction are not interruptible.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    /// True once [`Self::abandon`] has been called.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

/// `2^retry_count` milliseconds, capped at `cap_ms`. Pure function of the
/// retry count alone, so it is unit-testable without a clock or RNG.
pub fn exponential_backoff_ms(retry_count: u32, cap_ms: u64) -> u64 {
    let raw = 1u64.checked_shl(retry_count.min(40)).unwrap_or(u64::MAX);
    raw.min(cap_ms)
}

/// A jittered delay derived from [`exponential_backoff_ms`]: uniformly
/// random in `[0, backoff]`, the same "full jitter" shape used to avoid
/// synchronized retries among competing lockers.
pub fn jittered_delay(retry_count: u32, cap_ms: u64) -> Duration {
    let bound = exponential_backoff_ms(retry_count, cap_ms);
    let jitter = rand::thread_rng().gen_range(0..=bound.max(1));
    Duration::from_millis(jitter)
}
