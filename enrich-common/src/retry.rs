//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure operation retrying, and the bounded
//! retry loop the retry-call strategy runs every remote call through.
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time;

use tracing::debug;

use crate::error::{OperationError, OperationFailed};
use crate::metrics_consts::OPERATION_RETRIES;

/// Computes the backoff before the given retry (1-based).
pub type BackoffFn = Arc<dyn Fn(u32) -> time::Duration + Send + Sync>;

#[derive(Clone)]
/// A retry policy to determine how often and how far apart an operation is retried.
pub struct RetryPolicy {
    /// How many retries follow the first attempt before the operation fails for good.
    pub max_retries: u32,
    /// Coefficient to multiply initial_interval with for every past retry.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// Replaces the exponential schedule when set.
    pub backoff_fn: Option<BackoffFn>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine interval for the given retry number, starting at 1.
    /// If not `None`, this method will respect `preferred_retry_interval` as long as it falls within `candidate_interval <= preferred_retry_interval <= maximum_interval`.
    pub fn retry_interval(
        &self,
        retry: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let candidate_interval = match &self.backoff_fn {
            Some(backoff) => backoff(retry),
            None => self
                .backoff_coefficient
                .checked_pow(retry.saturating_sub(1))
                .and_then(|factor| self.initial_interval.checked_mul(factor))
                .unwrap_or(time::Duration::MAX),
        };

        match (preferred_retry_interval, self.maximum_interval) {
            (Some(duration), Some(max_interval)) => {
                let min_interval_allowed = std::cmp::min(candidate_interval, max_interval);

                if min_interval_allowed <= duration && duration <= max_interval {
                    duration
                } else {
                    min_interval_allowed
                }
            }
            (Some(duration), None) => std::cmp::max(candidate_interval, duration),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff_coefficient", &self.backoff_coefficient)
            .field("initial_interval", &self.initial_interval)
            .field("maximum_interval", &self.maximum_interval)
            .field("backoff_fn", &self.backoff_fn.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_retries: u32,
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub backoff_fn: Option<BackoffFn>,
}

impl Default for RetryPolicyBuilder {
    /// Three retries, 2s, 4s then 8s apart.
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(2),
            maximum_interval: None,
            backoff_fn: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> RetryPolicyBuilder {
        self.max_retries = max_retries;
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn backoff_fn<F>(mut self, backoff: F) -> RetryPolicyBuilder
    where
        F: Fn(u32) -> time::Duration + Send + Sync + 'static,
    {
        self.backoff_fn = Some(Arc::new(backoff));
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            backoff_fn: self.backoff_fn.clone(),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or `policy.max_retries` retries are
/// spent. Backoff never shrinks between consecutive retries. Dropping the returned future
/// cancels the loop, including a pending backoff sleep.
pub async fn retry_operation<F, Fut, T>(
    policy: &RetryPolicy,
    eid: u64,
    mut operation: F,
) -> Result<T, OperationFailed>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OperationError>>,
{
    let mut retries = 0u32;
    let mut previous_interval = time::Duration::ZERO;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && retries < policy.max_retries => {
                retries += 1;
                let interval = policy
                    .retry_interval(retries, error.retry_after())
                    .max(previous_interval);
                previous_interval = interval;

                metrics::counter!(OPERATION_RETRIES).increment(1);
                debug!(eid, retries, ?interval, "retrying operation: {}", error);

                tokio::time::sleep(interval).await;
            }
            Err(error) => {
                return Err(OperationFailed {
                    eid,
                    attempts: retries + 1,
                    source: error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_policy_is_powers_of_two_seconds() {
        let retry_policy = RetryPolicy::default();

        assert_eq!(retry_policy.max_retries, 3);
        assert_eq!(retry_policy.retry_interval(1, None), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2, None), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3, None), time::Duration::from_secs(8));
    }

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();
        let first_interval = retry_policy.retry_interval(1, None);
        let second_interval = retry_policy.retry_interval(2, None);
        let third_interval = retry_policy.retry_interval(3, None);

        assert_eq!(first_interval, time::Duration::from_secs(2));
        assert_eq!(second_interval, time::Duration::from_secs(2));
        assert_eq!(third_interval, time::Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.retry_interval(1, None), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2, None), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3, None), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(40, None), time::Duration::from_secs(4));
    }

    #[test]
    fn test_retry_interval_respects_preferred() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();
        let preferred = time::Duration::from_secs(999);

        assert_eq!(retry_policy.retry_interval(1, Some(preferred)), preferred);
        assert_eq!(retry_policy.retry_interval(2, Some(preferred)), preferred);
    }

    #[test]
    fn test_retry_interval_ignores_large_preferred() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();
        let preferred = time::Duration::from_secs(10);

        assert_eq!(
            retry_policy.retry_interval(1, Some(preferred)),
            time::Duration::from_secs(2)
        );
        assert_eq!(
            retry_policy.retry_interval(2, Some(preferred)),
            time::Duration::from_secs(4)
        );
    }

    #[test]
    fn test_custom_backoff_fn() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(1))
            .backoff_fn(|retry| time::Duration::from_millis(100 * u64::from(retry)))
            .provide();

        assert_eq!(retry_policy.retry_interval(1, None), time::Duration::from_millis(100));
        assert_eq!(retry_policy.retry_interval(3, None), time::Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_operation_succeeds_after_failures() {
        let retry_policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = tokio::time::Instant::now();

        let result = retry_operation(&retry_policy, 1, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OperationError::transient("unavailable"))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two backoffs: 2s then 4s.
        assert_eq!(start.elapsed(), time::Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_operation_gives_up_after_max_retries() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_millis(10))
            .max_retries(3)
            .provide();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), _> = retry_operation(&retry_policy, 9, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(OperationError::transient("down"))
        })
        .await;

        let failed = result.unwrap_err();
        assert_eq!(failed.eid, 9);
        assert_eq!(failed.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let retry_policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), _> = retry_operation(&retry_policy, 2, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(OperationError::Permanent("bad request".to_owned()))
        })
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_never_decreases() {
        // A schedule that shrinks is clamped to the previous interval.
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(1))
            .backoff_fn(|retry| time::Duration::from_secs(u64::from(10 / retry)))
            .max_retries(3)
            .provide();
        let start = tokio::time::Instant::now();

        let result: Result<(), _> = retry_operation(&retry_policy, 0, || async {
            Err(OperationError::transient("down"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(start.elapsed(), time::Duration::from_secs(30));
    }
}
