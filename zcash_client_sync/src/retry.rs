//! Retry with geometric backoff for transient network failures.

use std::time::Duration;

use futures_util::future::BoxFuture;

/// The default number of attempts made for a block source call before its
/// error is surfaced.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// The default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// A bounded geometric backoff policy.
///
/// Attempt `n` (zero-based) is preceded by a delay of
/// `initial_delay * multiplier^(n-1)`, and at most `attempts` attempts are
/// made in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    initial_delay: Duration,
    multiplier: u32,
}

impl RetryPolicy {
    /// Constructs a retry policy from its constituent parts.
    ///
    /// # Panics
    ///
    /// Panics if `attempts` is zero; a policy that never attempts the call is
    /// a programmer error.
    pub fn new(attempts: u32, initial_delay: Duration, multiplier: u32) -> Self {
        assert!(attempts > 0, "retry policy must permit at least one attempt");
        Self {
            attempts,
            initial_delay,
            multiplier,
        }
    }

    /// The maximum number of attempts made.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the delay preceding the given zero-based retry.
    fn delay_before(&self, retry: u32) -> Duration {
        self.initial_delay * self.multiplier.saturating_pow(retry)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_ATTEMPTS, DEFAULT_INITIAL_DELAY, 2)
    }
}

/// Invokes `op` on `resource` until it succeeds, the policy's attempt budget
/// is exhausted, or it fails with an error that `retryable` rejects.
///
/// `resource` is threaded through explicitly so that `op` may be a plain
/// method reference on a mutably-borrowed client (the boxed-future shape
/// produced by `async_trait` methods satisfies the bound directly). The final
/// error is returned unchanged, so callers observe the same error type
/// whether or not retries occurred.
pub async fn with_retry<R, T, E>(
    policy: &RetryPolicy,
    resource: &mut R,
    retryable: impl Fn(&E) -> bool,
    op: impl for<'r> Fn(&'r mut R) -> BoxFuture<'r, Result<T, E>>,
) -> Result<T, E>
where
    R: ?Sized,
    E: std::fmt::Display,
{
    let mut failed_attempts = 0;
    loop {
        match op(resource).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                failed_attempts += 1;
                if failed_attempts >= policy.attempts || !retryable(&e) {
                    return Err(e);
                }
                let delay = policy.delay_before(failed_attempts - 1);
                tracing::warn!(
                    "Attempt {}/{} failed, retrying in {:?}: {}",
                    failed_attempts,
                    policy.attempts,
                    delay,
                    e,
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::FutureExt;

    use super::{with_retry, RetryPolicy};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), 2)
    }

    #[tokio::test]
    async fn returns_first_success() {
        let mut calls = 0u32;
        let result: Result<u32, String> = with_retry(&fast_policy(3), &mut calls, |_| true, |c| {
            *c += 1;
            async { Ok(7) }.boxed()
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retries_until_budget_exhausted() {
        let mut calls = 0u32;
        let result: Result<u32, String> = with_retry(&fast_policy(3), &mut calls, |_| true, |c| {
            *c += 1;
            async { Err("nope".to_string()) }.boxed()
        })
        .await;
        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let mut calls = 0u32;
        let result: Result<u32, String> = with_retry(
            &fast_policy(5),
            &mut calls,
            |e| e != "fatal",
            |c| {
                *c += 1;
                async { Err("fatal".to_string()) }.boxed()
            },
        )
        .await;
        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let mut calls = 0u32;
        let result: Result<u32, String> = with_retry(&fast_policy(5), &mut calls, |_| true, |c| {
            *c += 1;
            let attempt = *c;
            async move {
                if attempt < 3 {
                    Err("flaky".to_string())
                } else {
                    Ok(attempt)
                }
            }
            .boxed()
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn delays_grow_geometrically() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100), 2);
        assert_eq!(policy.delay_before(0), Duration::from_millis(100));
        assert_eq!(policy.delay_before(1), Duration::from_millis(200));
        assert_eq!(policy.delay_before(2), Duration::from_millis(400));
    }
}
