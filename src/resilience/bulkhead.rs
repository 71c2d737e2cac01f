//! Bulkhead Pattern
//!
//! Bounds the number of concurrent executions so one slow dependency cannot
//! absorb every task in the process. Acquisition is timed: callers that
//! cannot get a slot within `max_wait` are rejected outright.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{ErrorKind, MeshError, Result};
use crate::metrics;

/// Configuration for a bulkhead
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum concurrent executions
    pub max_concurrent: usize,
    /// Maximum time to wait for a free slot
    pub max_wait: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_wait: Duration::from_secs(5),
        }
    }
}

/// Bounded concurrent-execution gate with timed acquire.
pub struct Bulkhead {
    name: String,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    config: BulkheadConfig,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            in_flight: AtomicUsize::new(0),
            config,
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BulkheadConfig::default())
    }

    /// Runs `op` inside a slot. The slot is released on every exit path,
    /// including panics inside `op` (the permit guard drops either way).
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let permit = match tokio::time::timeout(
            self.config.max_wait,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(MeshError::internal("bulkhead semaphore closed")
                    .with_context("bulkhead", &self.name));
            }
            Err(_) => {
                metrics::record_bulkhead_rejection(&self.name);
                warn!(
                    bulkhead = %self.name,
                    max_wait_ms = self.config.max_wait.as_millis() as u64,
                    "Bulkhead rejected execution"
                );
                return Err(MeshError::new(
                    ErrorKind::BulkheadRejected,
                    "no execution slot freed within max wait",
                )
                .with_context("bulkhead", &self.name));
            }
        };

        let count = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_bulkhead_in_flight(&self.name, count as i64);

        struct Slot<'a> {
            bulkhead: &'a Bulkhead,
            _permit: tokio::sync::OwnedSemaphorePermit,
        }
        impl Drop for Slot<'_> {
            fn drop(&mut self) {
                let count = self.bulkhead.in_flight.fetch_sub(1, Ordering::Relaxed) - 1;
                metrics::set_bulkhead_in_flight(&self.bulkhead.name, count as i64);
            }
        }

        let _slot = Slot {
            bulkhead: self,
            _permit: permit,
        };

        op().await
    }

    /// Executions currently inside the bulkhead.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Free slots.
    pub fn remaining(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn bulkhead(max_concurrent: usize, max_wait_ms: u64) -> Bulkhead {
        Bulkhead::new(
            "test",
            BulkheadConfig {
                max_concurrent,
                max_wait: Duration::from_millis(max_wait_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_executes_within_capacity() {
        let bh = bulkhead(2, 100);
        let result = bh.execute(|| async { Ok::<_, MeshError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(bh.in_flight(), 0);
        assert_eq!(bh.remaining(), 2);
    }

    #[tokio::test]
    async fn test_rejects_when_full() {
        let bh = Arc::new(bulkhead(1, 50));

        let blocker = bh.clone();
        let hold = tokio::spawn(async move {
            blocker
                .execute(|| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<_, MeshError>(())
                })
                .await
        });

        // Give the first execution time to take the slot.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = bh
            .execute(|| async { Ok::<_, MeshError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BulkheadRejected);

        hold.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_bound() {
        let bh = Arc::new(bulkhead(3, 5_000));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let bh = bh.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                bh.execute(|| async {
                    let current = bh.in_flight();
                    peak.fetch_max(current, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, MeshError>(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::Relaxed) <= 3);
        assert_eq!(bh.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_slot_released_on_error() {
        let bh = bulkhead(1, 100);
        let _ = bh
            .execute(|| async { Err::<(), _>(MeshError::internal("boom")) })
            .await;
        assert_eq!(bh.remaining(), 1);

        // Slot is free again.
        bh.execute(|| async { Ok::<_, MeshError>(()) })
            .await
            .unwrap();
    }
}
