//! Exponential backoff retry for lock contention (serialization failure, deadlock,
//! lock-not-available).

use std::time::Duration;

use crate::error::KbError;

/// Retry parameters for a single operation. `Copy` so it can be passed around by
/// value and overridden per call without builder ceremony.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_retries, base_delay, max_delay }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(1u32 << attempt.min(20));
        scaled.min(self.max_delay)
    }
}

/// `true` for PostgreSQL error codes this crate treats as transient lock
/// contention: `40001` (serialization_failure), `40P01` (deadlock_detected),
/// `55P03` (lock_not_available).
#[cfg(feature = "postgres")]
pub fn is_lock_contention(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .map(|code| matches!(code.as_ref(), "40001" | "40P01" | "55P03"))
        .unwrap_or(false)
}

/// Run `op` under `policy`, retrying with exponential backoff whenever `op`
/// returns an error for which `is_retryable` is true. Surfaces [`KbError::LockExhausted`]
/// once `max_retries` is exceeded.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    target: &str,
    is_retryable: impl Fn(&KbError) -> bool,
    mut op: F,
) -> Result<T, KbError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, KbError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && is_retryable(&err) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    target = target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after lock contention"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) if is_retryable(&err) => {
                return Err(KbError::LockExhausted {
                    target: target.to_string(),
                    retries: attempt,
                });
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<i32, KbError> = with_retry(
            RetryPolicy::default(),
            "t",
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let result: Result<i32, KbError> = with_retry(policy, "t", |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(KbError::conflict("contended"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_retries() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5));
        let result: Result<i32, KbError> =
            with_retry(policy, "thing", |_| true, || async { Err(KbError::conflict("nope")) })
                .await;
        match result {
            Err(KbError::LockExhausted { target, retries }) => {
                assert_eq!(target, "thing");
                assert_eq!(retries, 2);
            }
            other => panic!("expected LockExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<i32, KbError> = with_retry(
            RetryPolicy::default(),
            "t",
            |_| false,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(KbError::invalid("bad input")) }
            },
        )
        .await;
        assert!(matches!(result, Err(KbError::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
