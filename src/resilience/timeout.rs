//! Scoped deadlines with grace periods
//!
//! The operation runs on a sibling task so a fired deadline does not tear
//! it down immediately: the caller waits up to the grace period for a
//! result that is already in flight before abandoning it.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{MeshError, Result};

/// Runs `op` with a deadline and a grace period.
///
/// On deadline expiry the task gets `grace` more time to finish; if it does,
/// its result is returned as if it had made the deadline. Otherwise the task
/// is aborted and the caller sees `TIMEOUT`. A zero deadline skips straight
/// to the grace wait.
pub async fn execute_with_timeout<F, T>(
    operation: &str,
    deadline: Duration,
    grace: Duration,
    op: F,
) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::spawn(op);

    if !deadline.is_zero() {
        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(joined) => return flatten(operation, joined),
            Err(_) => {}
        }
    }

    // Deadline fired (or was zero): allow the grace period.
    if !grace.is_zero() {
        if let Ok(joined) = tokio::time::timeout(grace, &mut handle).await {
            warn!(operation, "Operation finished within grace period");
            return flatten(operation, joined);
        }
    }

    handle.abort();
    warn!(
        operation,
        deadline_ms = deadline.as_millis() as u64,
        grace_ms = grace.as_millis() as u64,
        "Operation timed out"
    );
    Err(MeshError::timeout(format!("{} exceeded deadline", operation))
        .with_operation(operation))
}

fn flatten<T>(
    operation: &str,
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(join_err) if join_err.is_cancelled() => {
            Err(MeshError::canceled(format!("{} was canceled", operation)))
        }
        Err(join_err) => Err(MeshError::internal(format!(
            "{} panicked: {}",
            operation, join_err
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let result = execute_with_timeout(
            "fast",
            Duration::from_millis(100),
            Duration::from_millis(10),
            async { Ok::<_, MeshError>(1) },
        )
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_finishes_in_grace_period() {
        let result = execute_with_timeout(
            "slow-but-close",
            Duration::from_millis(10),
            Duration::from_millis(200),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, MeshError>("late but fine")
            },
        )
        .await;
        assert_eq!(result.unwrap(), "late but fine");
    }

    #[tokio::test]
    async fn test_times_out_past_grace() {
        let err = execute_with_timeout(
            "too-slow",
            Duration::from_millis(10),
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, MeshError>(())
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_zero_deadline_times_out_immediately() {
        let err = execute_with_timeout(
            "zero",
            Duration::ZERO,
            Duration::ZERO,
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, MeshError>(())
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let err = execute_with_timeout(
            "failing",
            Duration::from_millis(100),
            Duration::ZERO,
            async { Err::<(), _>(MeshError::not_found("task", "t9")) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
