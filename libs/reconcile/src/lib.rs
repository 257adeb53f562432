//! Retry primitives for reconciliation against a remote object store.
//!
//! Every mutating or listing call the propagator issues goes through
//! [`RetryPolicy::execute`]. Key properties:
//!
//! - Bounded: at most `attempts` calls, then the last error is returned
//! - Delays grow exponentially from `delay` and are capped at `max_delay`
//! - Only errors classified as retryable by [`Retryable`] are re-attempted
//! - No cancellation: once started, a loop runs to success or exhaustion
//!
//! Exhaustion is not an error of its own. The caller decides what giving up
//! means for the operation it wrapped.
//!
//! [`RequeueTracker`] holds back keys whose reconciliation failed until a
//! delay has passed.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Default number of attempts per operation.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

/// Default upper bound for the delay between attempts.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Classifies errors as transient (worth another attempt) or permanent.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Bounded retry policy with exponential, capped delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of calls, including the first one.
    pub attempts: u32,

    /// Delay before the first retry.
    pub delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default delays and the given attempt count.
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    /// Policy that never sleeps between attempts.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the given failed attempt (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `description` is logged on every retry.
    pub async fn execute<T, E, F, Fut>(&self, description: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    debug!(error = %e, "{description}: permanent failure, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{description}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Holds back keys whose last reconciliation failed.
///
/// A failed key is not reconciled again until `delay` has elapsed since
/// the failure.
#[derive(Debug, Clone)]
pub struct RequeueTracker {
    delay: Duration,

    /// key -> earliest time the key may be retried
    pending: BTreeMap<String, Instant>,
}

impl RequeueTracker {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: BTreeMap::new(),
        }
    }

    /// Record a failure for a key.
    pub fn record_failure(&mut self, key: &str) {
        self.pending
            .insert(key.to_string(), Instant::now() + self.delay);
    }

    /// True while the key is still waiting out its delay.
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending
            .get(key)
            .is_some_and(|not_before| Instant::now() < *not_before)
    }

    /// Forget a key (on success).
    pub fn clear(&mut self, key: &str) {
        self.pending.remove(key);
    }

    /// Drop entries whose delay has elapsed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.pending.retain(|_, not_before| now < *not_before);
    }

    /// Number of keys still held back.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable: {})", self.retryable)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for(3), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, TestError> = RetryPolicy::immediate(3)
            .execute("retrying test op", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TestError { retryable: true })
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), TestError> = RetryPolicy::immediate(4)
            .execute("retrying test op", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError { retryable: true })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), TestError> = RetryPolicy::immediate(5)
            .execute("retrying test op", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError { retryable: false })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_calls_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let _: Result<(), TestError> = RetryPolicy::immediate(0)
            .execute("retrying test op", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError { retryable: true })
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_requeue_tracker() {
        let mut tracker = RequeueTracker::new(Duration::from_secs(300));

        tracker.record_failure("policies/p1");
        assert!(tracker.is_pending("policies/p1"));
        assert!(!tracker.is_pending("policies/p2"));

        tracker.clear("policies/p1");
        assert!(!tracker.is_pending("policies/p1"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_requeue_tracker_zero_delay() {
        let mut tracker = RequeueTracker::new(Duration::ZERO);

        tracker.record_failure("policies/p1");
        assert!(!tracker.is_pending("policies/p1"));

        tracker.prune();
        assert_eq!(tracker.len(), 0);
    }
}
