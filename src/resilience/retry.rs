//! Retry with exponential backoff and jitter
//!
//! Classification lives on the error: [`MeshError::is_retryable`] encodes
//! the default policy and the `retryable` marker lets callers opt specific
//! errors in or out. The schedule is an exponential curve with bounded
//! jitter.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tracing::{debug, warn};

use crate::error::{MeshError, Result};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial retry delay
    pub initial_interval: Duration,
    /// Maximum retry delay
    pub max_interval: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Randomization factor applied to each delay (0.5 = +/- 50%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn schedule(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.jitter)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Executes `op`, retrying retryable failures up to `max_attempts`.
    ///
    /// Sleeps run on the caller's task, so dropping the returned future
    /// cancels any pending backoff.
    pub async fn execute<F, Fut, T>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut schedule = self.schedule();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= self.max_attempts || !err.is_retryable() {
                        if attempt > 1 {
                            warn!(
                                operation,
                                attempt,
                                error = %err,
                                "Giving up after retries"
                            );
                        }
                        return Err(err
                            .with_operation(operation)
                            .with_context("attempts", attempt));
                    }

                    let delay = schedule
                        .next_backoff()
                        .unwrap_or(self.max_interval);

                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable error, backing off"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Convenience wrapper: marks an arbitrary error retryable and runs it
/// through a policy. Used by callers that know a specific failure is
/// transient even though its kind is not.
pub async fn retry_marked<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, MeshError>>,
{
    policy
        .execute(operation, || {
            let fut = op();
            async move { fut.await.map_err(|e| e.retryable(true)) }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let policy = fast_policy(5);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_inner = calls.clone();
        let result = policy
            .execute("flaky", move || {
                let calls = calls_inner.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(MeshError::upstream("503"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_validation() {
        let policy = fast_policy(5);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_inner = calls.clone();
        let err = policy
            .execute("create", move || {
                let calls = calls_inner.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(MeshError::validation("missing field"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_does_not_retry_canceled() {
        let policy = fast_policy(5);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_inner = calls.clone();
        let err = policy
            .execute("get", move || {
                let calls = calls_inner.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(MeshError::canceled("caller dropped"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Canceled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let policy = fast_policy(3);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_inner = calls.clone();
        let err = policy
            .execute("always-down", move || {
                let calls = calls_inner.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(MeshError::upstream("502"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.context.get("attempts").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn test_marker_opts_error_into_retry() {
        let policy = fast_policy(3);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_inner = calls.clone();
        let result = retry_marked(&policy, "marked", move || {
            let calls = calls_inner.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(MeshError::internal("transient internal"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
