//! Per-key exponential backoff for failed reconciles
//!
//! Every failure of a key doubles its delay, starting at the base delay and
//! capped at the maximum. Retries are unbounded; a successful reconcile
//! forgets the key and resets its delay.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// Default delay for the first retry
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default cap on the retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Decides how long a failed item waits before it is queued again
pub trait RateLimiter<T>: Send + Sync {
    /// Record a failure of `item` and return the delay before its next attempt
    fn when(&self, item: &T) -> Duration;
    /// Stop tracking `item`
    fn forget(&self, item: &T);
    /// Failures recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &T) -> u32;
}

/// Exponential per-item backoff
#[derive(Debug)]
pub struct ExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ExponentialBackoff<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Default for ExponentialBackoff<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<T> RateLimiter<T> for ExponentialBackoff<T>
where
    T: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        let attempt = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let delay = compute_backoff(attempt, self.base, self.max);
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry with exponential backoff"
        );
        delay
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped at `max`
pub fn compute_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let factor = 1u64 << exponent;
    let nanos = (base.as_nanos() as u64).saturating_mul(factor);
    Duration::from_nanos(nanos).min(max)
}
