use crate::error::RequestError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

/// Attempt limit, per-attempt timeout and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts (first try included); `0` behaves like `1`.
    pub attempts: u32,
    /// Hard timeout for each attempt.
    pub timeout: Duration,
    /// Delay before the first retry.
    pub backoff_base: Duration,
    /// Upper bound on any delay.
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt: `min(base * 2^(attempt-1), cap)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// Timeouts count as ordinary failures. Only the last failure is returned.
///
/// # Errors
/// Returns the last attempt's error, or [`RequestError::TimedOut`] if the last
/// attempt timed out.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    key: &str,
    operation: &F,
) -> Result<T, RequestError<E>>
where
    E: Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let failure = match time::timeout(policy.timeout, operation()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(key, attempt, "request succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(err)) => RequestError::Operation(err),
            Err(_) => RequestError::TimedOut {
                after: policy.timeout,
            },
        };

        if attempt >= attempts {
            warn!(key, attempt, error = %failure, "request failed, retries exhausted");
            return Err(failure);
        }

        let delay = policy.backoff(attempt);
        warn!(
            key,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %failure,
            "request attempt failed, retrying"
        );
        time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            timeout: Duration::from_millis(100),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(35),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy(5);
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(35));
        assert_eq!(policy.backoff(40), Duration::from_millis(35));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("failure {n}")) } else { Ok(n) }
            }
        };

        let result = run_with_retry(&policy(3), "contracts", &op).await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_last_error_after_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<(), _>(format!("failure {n}"))
            }
        };

        let result = run_with_retry(&policy(3), "contracts", &op).await;
        assert_eq!(result, Err(RequestError::Operation("failure 3".to_owned())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_retried_like_a_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, String>(n)
            }
        };

        let result = run_with_retry(&policy(2), "slow", &op).await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn final_timeout_is_reported() {
        let op = || async {
            time::sleep(Duration::from_secs(5)).await;
            Ok::<(), String>(())
        };
        let result = run_with_retry(&policy(2), "slow", &op).await;
        assert_eq!(
            result,
            Err(RequestError::TimedOut {
                after: Duration::from_millis(100)
            })
        );
    }
}
