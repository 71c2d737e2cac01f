//! Webhook retry manager
//!
//! Failed deliveries are re-enqueued after an exponential backoff with
//! jitter, up to a bounded number of attempts. The pending set lives in a
//! pluggable store; the in-memory default loses retries on restart,
//! persistent implementations keep them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::{MeshError, Result};
use crate::metrics;

use super::WebhookEvent;

/// Configuration for webhook retries
#[derive(Debug, Clone)]
pub struct WebhookRetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// Jitter as a fraction of the computed delay (0.1 = +/- 10%)
    pub jitter_pct: f64,
}

impl Default for WebhookRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter_pct: 0.1,
        }
    }
}

/// Pending-retry storage. In-memory by default; persistent stores let
/// retries survive a restart.
#[async_trait]
pub trait RetryStore: Send + Sync {
    async fn record(&self, event: &WebhookEvent) -> Result<()>;
    async fn remove(&self, delivery_id: &str) -> Result<()>;
    async fn pending(&self) -> Result<Vec<WebhookEvent>>;
}

/// Default store: a mutex-guarded map.
#[derive(Default)]
pub struct MemoryRetryStore {
    inner: Mutex<HashMap<String, WebhookEvent>>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RetryStore for MemoryRetryStore {
    async fn record(&self, event: &WebhookEvent) -> Result<()> {
        self.inner
            .lock()
            .insert(event.delivery_id.clone(), event.clone());
        Ok(())
    }

    async fn remove(&self, delivery_id: &str) -> Result<()> {
        self.inner.lock().remove(delivery_id);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<WebhookEvent>> {
        Ok(self.inner.lock().values().cloned().collect())
    }
}

/// Schedules redelivery of failed webhook events.
pub struct RetryManager {
    config: WebhookRetryConfig,
    store: Arc<dyn RetryStore>,
}

impl RetryManager {
    pub fn new(config: WebhookRetryConfig, store: Arc<dyn RetryStore>) -> Self {
        Self { config, store }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            WebhookRetryConfig::default(),
            Arc::new(MemoryRetryStore::new()),
        )
    }

    /// Backoff for a given attempt: `initial * factor^attempt`, jittered,
    /// capped at `max_backoff`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff.as_millis() as f64
            * self.config.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.config.max_backoff.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_pct;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Handles a processing failure. With retries remaining, records the
    /// event and spawns a redelivery after the backoff; the re-enqueue
    /// happens only after this attempt completed, so retries of one
    /// delivery-id stay sequential. Returns false when attempts are
    /// exhausted.
    pub async fn schedule(
        &self,
        mut event: WebhookEvent,
        requeue: mpsc::Sender<WebhookEvent>,
        cause: &MeshError,
    ) -> Result<bool> {
        if event.retry_count >= self.config.max_retries {
            error!(
                delivery_id = %event.delivery_id,
                event = %event.event_kind,
                retries = event.retry_count,
                error = %cause,
                "Webhook processing failed permanently"
            );
            metrics::record_webhook_event(&event.event_kind, "exhausted");
            self.store.remove(&event.delivery_id).await?;
            return Ok(false);
        }

        let delay = self.delay_for(event.retry_count);
        event.retry_count += 1;

        warn!(
            delivery_id = %event.delivery_id,
            event = %event.event_kind,
            attempt = event.retry_count,
            max = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "Scheduling webhook redelivery"
        );

        self.store.record(&event).await?;
        metrics::record_webhook_retry(&event.event_kind);

        let store = self.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let delivery_id = event.delivery_id.clone();
            match requeue.send(event).await {
                Ok(()) => {
                    let _ = store.remove(&delivery_id).await;
                }
                Err(e) => {
                    // Queue closed during shutdown; the store keeps the
                    // event for persistent implementations.
                    info!(delivery_id = %delivery_id, error = %e, "Redelivery skipped, queue closed");
                }
            }
        });

        Ok(true)
    }

    /// Deliveries currently awaiting redelivery.
    pub async fn pending(&self) -> Result<Vec<WebhookEvent>> {
        self.store.pending().await
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_retries: u32) -> RetryManager {
        RetryManager::new(
            WebhookRetryConfig {
                max_retries,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(80),
                backoff_factor: 2.0,
                jitter_pct: 0.0,
            },
            Arc::new(MemoryRetryStore::new()),
        )
    }

    #[test]
    fn test_delay_schedule_is_exponential_and_capped() {
        let m = manager(5);
        assert_eq!(m.delay_for(0), Duration::from_millis(10));
        assert_eq!(m.delay_for(1), Duration::from_millis(20));
        assert_eq!(m.delay_for(2), Duration::from_millis(40));
        assert_eq!(m.delay_for(3), Duration::from_millis(80));
        // Capped
        assert_eq!(m.delay_for(6), Duration::from_millis(80));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let m = RetryManager::new(
            WebhookRetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(10),
                backoff_factor: 2.0,
                jitter_pct: 0.1,
            },
            Arc::new(MemoryRetryStore::new()),
        );
        for _ in 0..50 {
            let d = m.delay_for(0).as_millis() as f64;
            assert!((90.0..=110.0).contains(&d), "delay {} out of band", d);
        }
    }

    #[tokio::test]
    async fn test_schedule_requeues_with_incremented_count() {
        let m = manager(3);
        let (tx, mut rx) = mpsc::channel(4);

        let event = WebhookEvent::new("push", "D1", b"{}".to_vec());
        let cause = MeshError::internal("handler failed");

        let scheduled = m.schedule(event, tx, &cause).await.unwrap();
        assert!(scheduled);

        let redelivered = rx.recv().await.unwrap();
        assert_eq!(redelivered.retry_count, 1);
        assert_eq!(redelivered.delivery_id, "D1");
    }

    #[tokio::test]
    async fn test_schedule_gives_up_after_max_retries() {
        let m = manager(2);
        let (tx, mut rx) = mpsc::channel(4);

        let mut event = WebhookEvent::new("push", "D1", b"{}".to_vec());
        event.retry_count = 2;

        let scheduled = m
            .schedule(event, tx, &MeshError::internal("still failing"))
            .await
            .unwrap();
        assert!(!scheduled);
        assert!(rx.try_recv().is_err());
        assert!(m.pending().await.unwrap().is_empty());
    }
}
