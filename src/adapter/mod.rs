//! Adapter orchestrator
//!
//! Builds the auth provider, resilience chain, REST and GraphQL clients,
//! and the webhook pipeline from one configuration; owns their lifecycles;
//! and feeds every observed rate-limit snapshot back into the adaptive
//! limiter.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::auth::{
    AnonymousProvider, AppAuthProvider, ContextAwareProvider, CredentialProvider, OAuthProvider,
    TokenProvider,
};
use crate::config::Config;
use crate::error::{MeshError, Result};
use crate::graphql::{GraphQlClient, GraphQlClientConfig};
use crate::resilience::{
    AdaptiveRateLimiter, Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig,
    RateLimiterConfig, RetryPolicy,
};
use crate::rest::{RestClient, RestClientConfig};
use crate::webhook::{
    ReplayGuard, RetryManager, WebhookEvent, WebhookHandler, WebhookManager,
    WebhookManagerConfig, WebhookRetryConfig, WebhookValidator, WebhookValidatorConfig,
};

/// Adapter health as exposed to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterHealth {
    Healthy,
    Closed,
}

impl AdapterHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, AdapterHealth::Healthy)
    }
}

impl std::fmt::Display for AdapterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterHealth::Healthy => f.write_str("healthy"),
            AdapterHealth::Closed => f.write_str("closed"),
        }
    }
}

/// The GitHub adapter: one façade over REST, GraphQL, and webhooks.
pub struct MeshAdapter {
    rest: Arc<RestClient>,
    graphql: Arc<GraphQlClient>,
    limiter: Arc<AdaptiveRateLimiter>,
    webhooks: Option<Arc<WebhookManager>>,
    closed: AtomicBool,
}

impl MeshAdapter {
    /// Builds an adapter with no webhook handlers registered.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        Self::with_handlers(config, HashMap::new()).await
    }

    /// Builds an adapter with a fixed webhook handler registry.
    pub async fn with_handlers(
        config: Arc<Config>,
        handlers: HashMap<String, Arc<dyn WebhookHandler>>,
    ) -> Result<Self> {
        let auth = Arc::new(ContextAwareProvider::new(build_provider(&config)?));

        let limiter = Arc::new(AdaptiveRateLimiter::new(
            "github",
            RateLimiterConfig {
                requests_per_second: config.requests_per_second,
                burst: config.burst,
                max_wait: Duration::from_millis(config.rate_limit_wait_ms),
            },
        ));

        let bulkhead = Arc::new(Bulkhead::new(
            "github",
            BulkheadConfig {
                max_concurrent: config.max_concurrent_requests,
                max_wait: Duration::from_millis(config.bulkhead_wait_ms),
            },
        ));

        let breaker = Arc::new(CircuitBreaker::new(
            "github",
            CircuitBreakerConfig {
                failure_ratio: config.circuit_failure_ratio,
                min_samples: config.circuit_min_samples,
                reset_timeout: Duration::from_secs(config.circuit_reset_secs),
                half_open_max_probes: config.circuit_half_open_probes,
                ..Default::default()
            },
        ));

        let retry = RetryPolicy {
            max_attempts: config.max_retries.max(1),
            initial_interval: Duration::from_millis(config.initial_retry_delay_ms),
            max_interval: Duration::from_millis(config.max_retry_delay_ms),
            multiplier: config.retry_multiplier,
            jitter: config.retry_jitter,
        };

        let rest = Arc::new(RestClient::new(
            RestClientConfig {
                base_url: config.api_base_url.clone(),
                user_agent: config.user_agent.clone(),
                request_timeout: config.request_timeout(),
                connect_timeout: Duration::from_millis(config.connect_timeout_ms),
                conditional_cache_capacity: config.conditional_cache_capacity,
            },
            auth.clone(),
            limiter.clone(),
            bulkhead.clone(),
            breaker.clone(),
            retry.clone(),
        )?);

        let graphql = Arc::new(GraphQlClient::new(
            GraphQlClientConfig {
                endpoint: config.graphql_url.clone(),
                user_agent: config.user_agent.clone(),
                request_timeout: config.request_timeout(),
            },
            auth,
            limiter.clone(),
            bulkhead,
            breaker,
            retry,
        )?);

        // Every observed quota snapshot feeds the limiter.
        let feedback = limiter.clone();
        let callback: crate::rest::RateLimitCallback =
            Arc::new(move |snapshot| feedback.adjust_rate_limit(snapshot));
        rest.set_rate_limit_callback(callback.clone());
        graphql.set_rate_limit_callback(callback);

        let webhooks = if config.has_webhook_secret() {
            let replay = Arc::new(ReplayGuard::new(
                Duration::from_secs(config.webhook_replay_window_secs),
                100_000,
            ));
            let validator = WebhookValidator::new(
                WebhookValidatorConfig {
                    secret: config.webhook_secret.clone().unwrap_or_default(),
                    allowed_ips: config.webhook_allowed_ips.clone(),
                },
                replay,
            );
            let retry_manager = RetryManager::new(
                WebhookRetryConfig {
                    max_retries: config.webhook_max_retries,
                    initial_backoff: Duration::from_millis(config.webhook_initial_backoff_ms),
                    max_backoff: Duration::from_millis(config.webhook_max_backoff_ms),
                    backoff_factor: config.webhook_backoff_factor,
                    jitter_pct: config.webhook_jitter_pct,
                },
                Arc::new(crate::webhook::MemoryRetryStore::new()),
            );
            Some(WebhookManager::new(
                WebhookManagerConfig {
                    queue_capacity: config.webhook_queue_capacity,
                    workers: config.webhook_workers,
                    shutdown_timeout: Duration::from_secs(10),
                },
                validator,
                handlers,
                retry_manager,
            ))
        } else {
            None
        };

        info!(
            api_base = %config.api_base_url,
            webhooks = webhooks.is_some(),
            "Adapter constructed"
        );

        Ok(Self {
            rest,
            graphql,
            limiter,
            webhooks,
            closed: AtomicBool::new(false),
        })
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn graphql(&self) -> &GraphQlClient {
        &self.graphql
    }

    pub fn rate_limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    /// Accepts a webhook delivery into the pipeline.
    pub async fn handle_webhook(
        &self,
        event: WebhookEvent,
        signature: &str,
        remote_addr: Option<IpAddr>,
    ) -> Result<()> {
        match &self.webhooks {
            Some(manager) => manager.handle_webhook(event, signature, remote_addr).await,
            None => Err(MeshError::internal("webhook pipeline is not configured")),
        }
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn adapter_type(&self) -> &'static str {
        "github"
    }

    /// Healthy while the adapter is open and, when webhooks are
    /// configured, its workers are alive.
    pub fn health(&self) -> AdapterHealth {
        if self.closed.load(Ordering::SeqCst) {
            return AdapterHealth::Closed;
        }
        if let Some(manager) = &self.webhooks {
            if manager.is_closed() || !manager.workers_alive() {
                return AdapterHealth::Closed;
            }
        }
        AdapterHealth::Healthy
    }

    /// Idempotent: tears down the webhook pipeline and marks the adapter
    /// closed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = &self.webhooks {
            let _ = manager.close().await;
        }
        info!("Adapter closed");
    }
}

fn build_provider(config: &Config) -> Result<Arc<dyn CredentialProvider>> {
    Ok(match config.auth_mode.as_str() {
        "token" => Arc::new(TokenProvider::new(
            config.api_token.clone().unwrap_or_default(),
        )),
        "oauth" => Arc::new(OAuthProvider::new(
            config.api_token.clone().unwrap_or_default(),
        )),
        "app" => Arc::new(AppAuthProvider::new(
            config.app_id.clone().unwrap_or_default(),
            config.app_installation_id.clone(),
            config.app_private_key.as_deref().unwrap_or_default(),
        )?),
        _ => Arc::new(AnonymousProvider),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            auth_mode: "token".to_string(),
            api_token: Some("test-token".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_constructs_without_webhooks() {
        let adapter = MeshAdapter::new(Arc::new(base_config())).await.unwrap();
        assert_eq!(adapter.adapter_type(), "github");
        assert_eq!(adapter.health(), AdapterHealth::Healthy);
        adapter.close().await;
        assert_eq!(adapter.health(), AdapterHealth::Closed);
    }

    #[tokio::test]
    async fn test_webhook_delivery_without_pipeline_fails() {
        let adapter = MeshAdapter::new(Arc::new(base_config())).await.unwrap();
        let event = WebhookEvent::new("push", "D1", b"{}".to_vec());
        assert!(adapter.handle_webhook(event, "sig", None).await.is_err());
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_webhook_pipeline_health() {
        let config = Config {
            webhook_secret: Some("secret".to_string()),
            webhook_workers: 2,
            ..base_config()
        };
        let adapter = MeshAdapter::new(Arc::new(config)).await.unwrap();
        assert_eq!(adapter.health(), AdapterHealth::Healthy);

        adapter.close().await;
        assert_eq!(adapter.health(), AdapterHealth::Closed);
        // Idempotent
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_rate_limit_feedback_reaches_limiter() {
        let adapter = MeshAdapter::new(Arc::new(base_config())).await.unwrap();
        let before = adapter.rate_limiter().effective_rate();

        adapter
            .rate_limiter()
            .adjust_rate_limit(crate::resilience::RateLimitSnapshot {
                limit: 5000,
                remaining: 100,
                reset: chrono::Utc::now() + chrono::Duration::seconds(600),
                used: 4900,
            });

        assert!(adapter.rate_limiter().effective_rate() < before);
        adapter.close().await;
    }
}
