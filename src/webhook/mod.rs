//! Webhook ingestion pipeline
//!
//! HTTP boundary -> [`validator`] (signature, replay, source) ->
//! bounded queue -> worker pool ([`queue`]) -> handler; failed handlers go
//! through the [`retry`] manager with backoff and jitter.

pub mod intake;
pub mod queue;
pub mod replay;
pub mod retry;
pub mod validator;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use queue::{WebhookManager, WebhookManagerConfig};
pub use replay::ReplayGuard;
pub use retry::{MemoryRetryStore, RetryManager, RetryStore, WebhookRetryConfig};
pub use validator::{WebhookValidator, WebhookValidatorConfig};

/// A single webhook delivery as received at the HTTP boundary.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    /// Event kind from the event-kind header.
    pub event_kind: String,
    /// Upstream delivery id; the replay key.
    pub delivery_id: String,
    /// Raw payload bytes; the signature covers exactly these.
    pub payload: Vec<u8>,
    /// Headers captured at the boundary.
    pub headers: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl WebhookEvent {
    pub fn new(
        event_kind: impl Into<String>,
        delivery_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_kind: event_kind.into(),
            delivery_id: delivery_id.into(),
            payload,
            headers: HashMap::new(),
            received_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Payload parsed as JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.payload).map_err(Into::into)
    }
}

/// Processes validated deliveries. Registered by event kind at manager
/// construction; `"*"` catches kinds without a dedicated handler.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> Result<()>;
}
