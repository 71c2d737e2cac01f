//! Webhook queue and worker pool
//!
//! Deliveries that pass validation enter a bounded channel; enqueueing
//! never blocks, a full queue fails fast with `QUEUE_FULL`. A fixed pool
//! of workers drains the channel until it closes or shutdown fires.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{ErrorKind, MeshError, Result};
use crate::metrics;

use super::retry::RetryManager;
use super::validator::WebhookValidator;
use super::{WebhookEvent, WebhookHandler};

/// Handler key that catches event kinds without a dedicated handler.
pub const CATCH_ALL: &str = "*";

/// Configuration for the webhook manager
#[derive(Debug, Clone)]
pub struct WebhookManagerConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    /// How long `close` waits for workers to drain
    pub shutdown_timeout: Duration,
}

impl Default for WebhookManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            workers: 4,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Owns the queue, the worker pool, and the retry wiring.
pub struct WebhookManager {
    config: WebhookManagerConfig,
    validator: WebhookValidator,
    handlers: Arc<HashMap<String, Arc<dyn WebhookHandler>>>,
    retry: Arc<RetryManager>,
    /// Enqueue side; taken exactly once on close.
    tx: Mutex<Option<mpsc::Sender<WebhookEvent>>>,
    /// Clone held for retry re-enqueues.
    requeue_tx: mpsc::Sender<WebhookEvent>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WebhookManager {
    /// Builds the manager and starts its workers. The handler registry is
    /// fixed at construction.
    pub fn new(
        config: WebhookManagerConfig,
        validator: WebhookValidator,
        handlers: HashMap<String, Arc<dyn WebhookHandler>>,
        retry: RetryManager,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<WebhookEvent>(config.queue_capacity);
        let (shutdown_tx, _) = broadcast::channel(1);

        let manager = Arc::new(Self {
            requeue_tx: tx.clone(),
            tx: Mutex::new(Some(tx)),
            validator,
            handlers: Arc::new(handlers),
            retry: Arc::new(retry),
            shutdown_tx: shutdown_tx.clone(),
            workers: Mutex::new(Vec::with_capacity(config.workers)),
            closed: AtomicBool::new(false),
            config,
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = manager.workers.lock();
        for id in 0..manager.config.workers {
            let worker = manager.clone();
            let rx = rx.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            workers.push(tokio::spawn(
                async move { worker.worker_loop(id, rx, shutdown_rx).await }
                    .instrument(tracing::info_span!("webhook_worker", worker = id)),
            ));
        }
        drop(workers);

        info!(
            workers = manager.config.workers,
            capacity = manager.config.queue_capacity,
            "Webhook manager started"
        );

        manager
    }

    /// Validates and enqueues a delivery. Never blocks: a full queue is an
    /// immediate `QUEUE_FULL` so the submitter can fall back to
    /// [`WebhookManager::process_sync`].
    pub async fn handle_webhook(
        &self,
        event: WebhookEvent,
        signature: &str,
        remote_addr: Option<IpAddr>,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::internal("webhook manager is closed"));
        }

        self.validator.validate(&event, signature, remote_addr).await?;

        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(MeshError::internal("webhook queue is closed"));
        };

        let kind = event.event_kind.clone();
        match tx.try_send(event) {
            Ok(()) => {
                metrics::record_webhook_event(&kind, "enqueued");
                metrics::set_webhook_queue_depth(
                    "webhook",
                    (self.config.queue_capacity - tx.capacity()) as i64,
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_webhook_event(&kind, "queue_full");
                warn!(event = %kind, "Webhook queue full, delivery rejected");
                Err(MeshError::new(
                    ErrorKind::QueueFull,
                    "webhook queue is at capacity",
                ))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(MeshError::internal("webhook queue is closed"))
            }
        }
    }

    /// Synchronous fallback: validates and processes on the caller's task,
    /// bypassing the queue.
    pub async fn process_sync(
        &self,
        event: WebhookEvent,
        signature: &str,
        remote_addr: Option<IpAddr>,
    ) -> Result<()> {
        self.validator.validate(&event, signature, remote_addr).await?;
        self.process(&event).await
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WebhookEvent>>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        debug!(worker, "Webhook worker started");

        loop {
            let event = tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(worker, "Webhook worker received shutdown");
                    break;
                }
                received = async { rx.lock().await.recv().await } => {
                    match received {
                        Some(event) => event,
                        None => {
                            debug!(worker, "Webhook queue closed");
                            break;
                        }
                    }
                }
            };

            metrics::inc_webhook_active_workers("webhook");
            let result = self.process(&event).await;
            metrics::dec_webhook_active_workers("webhook");

            if let Err(err) = result {
                match self
                    .retry
                    .schedule(event, self.requeue_tx.clone(), &err)
                    .await
                {
                    Ok(_) => {}
                    Err(store_err) => {
                        error!(error = %store_err, "Retry store failure");
                    }
                }
            }
        }

        debug!(worker, "Webhook worker stopped");
    }

    /// Dispatches a delivery to its handler (or the catch-all).
    async fn process(&self, event: &WebhookEvent) -> Result<()> {
        let handler = self
            .handlers
            .get(&event.event_kind)
            .or_else(|| self.handlers.get(CATCH_ALL));

        let Some(handler) = handler else {
            debug!(event = %event.event_kind, "No handler registered, delivery dropped");
            metrics::record_webhook_event(&event.event_kind, "unhandled");
            return Ok(());
        };

        match handler.handle(event).await {
            Ok(()) => {
                metrics::record_webhook_event(&event.event_kind, "processed");
                Ok(())
            }
            Err(err) => {
                metrics::record_webhook_event(&event.event_kind, "failed");
                Err(err
                    .with_context("delivery_id", &event.delivery_id)
                    .with_context("event", &event.event_kind))
            }
        }
    }

    /// Idempotent shutdown: signals workers, closes the queue exactly
    /// once, then waits up to the shutdown timeout for the pool to drain.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing webhook manager");
        let _ = self.shutdown_tx.send(());

        // Guarded against double-close by the Option take.
        drop(self.tx.lock().take());

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => {
                info!("Webhook manager closed");
                Ok(())
            }
            Err(_) => {
                error!(
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "Webhook workers did not drain in time"
                );
                Err(MeshError::timeout("webhook workers did not stop in time"))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True while the worker pool has live tasks.
    pub fn workers_alive(&self) -> bool {
        let workers = self.workers.lock();
        !workers.is_empty() && workers.iter().any(|w| !w.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::replay::ReplayGuard;
    use crate::webhook::retry::{MemoryRetryStore, WebhookRetryConfig};
    use crate::webhook::validator::{sign_payload, WebhookValidatorConfig};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    const SECRET: &[u8] = b"test-secret";

    struct CountingHandler {
        calls: Arc<AtomicU32>,
        fail_first: u32,
        delay: Duration,
    }

    #[async_trait]
    impl WebhookHandler for CountingHandler {
        async fn handle(&self, _event: &WebhookEvent) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(MeshError::internal("transient handler failure"))
            } else {
                Ok(())
            }
        }
    }

    fn manager(
        queue_capacity: usize,
        workers: usize,
        fail_first: u32,
    ) -> (Arc<WebhookManager>, Arc<AtomicU32>) {
        manager_with_delay(queue_capacity, workers, fail_first, Duration::ZERO)
    }

    fn manager_with_delay(
        queue_capacity: usize,
        workers: usize,
        fail_first: u32,
        delay: Duration,
    ) -> (Arc<WebhookManager>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = Arc::new(CountingHandler {
            calls: calls.clone(),
            fail_first,
            delay,
        });

        let mut handlers: HashMap<String, Arc<dyn WebhookHandler>> = HashMap::new();
        handlers.insert("push".to_string(), handler);

        let validator = WebhookValidator::new(
            WebhookValidatorConfig {
                secret: String::from_utf8(SECRET.to_vec()).unwrap(),
                allowed_ips: vec![],
            },
            Arc::new(ReplayGuard::new(Duration::from_secs(60), 1_000)),
        );

        let retry = RetryManager::new(
            WebhookRetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                backoff_factor: 2.0,
                jitter_pct: 0.0,
            },
            Arc::new(MemoryRetryStore::new()),
        );

        let m = WebhookManager::new(
            WebhookManagerConfig {
                queue_capacity,
                workers,
                shutdown_timeout: Duration::from_secs(1),
            },
            validator,
            handlers,
            retry,
        );
        (m, calls)
    }

    fn delivery(id: &str) -> (WebhookEvent, String) {
        let payload = br#"{"ref": "main"}"#.to_vec();
        let sig = sign_payload(SECRET, &payload);
        (WebhookEvent::new("push", id, payload), sig)
    }

    #[tokio::test]
    async fn test_delivery_is_processed() {
        let (m, calls) = manager(16, 2, 0);
        let (event, sig) = delivery("D1");

        m.handle_webhook(event, &sig, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried() {
        let (m, calls) = manager(16, 1, 2);
        let (event, sig) = delivery("D1");

        m.handle_webhook(event, &sig, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Two failures then one success.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_full_fails_fast() {
        // One queue slot and one worker pinned in a slow handler.
        let (m, _calls) = manager_with_delay(1, 1, 0, Duration::from_millis(400));

        let (e1, s1) = delivery("D1");
        let (e2, s2) = delivery("D2");
        let (e3, s3) = delivery("D3");

        m.handle_webhook(e1, &s1, None).await.unwrap();
        // Let the worker pull D1 into its slow handler.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // D2 occupies the single queue slot; D3 must fail fast.
        m.handle_webhook(e2, &s2, None).await.unwrap();
        let err = m.handle_webhook(e3, &s3, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QueueFull);

        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (m, _) = manager(4, 2, 0);
        m.close().await.unwrap();
        m.close().await.unwrap();
        assert!(m.is_closed());

        let (event, sig) = delivery("D1");
        assert!(m.handle_webhook(event, &sig, None).await.is_err());
    }

    #[tokio::test]
    async fn test_process_sync_fallback() {
        let (m, calls) = manager(4, 1, 0);
        let (event, sig) = delivery("D-sync");

        m.process_sync(event, &sig, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unhandled_kind_is_dropped_quietly() {
        let (m, calls) = manager(4, 1, 0);
        let payload = b"{}".to_vec();
        let sig = sign_payload(SECRET, &payload);
        let event = WebhookEvent::new("unknown_kind", "D1", payload);

        m.handle_webhook(event, &sig, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        m.close().await.unwrap();
    }
}
