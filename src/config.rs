//! Configuration for the Mesh Adapter

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Upstream API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_graphql_url")]
    pub graphql_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // Authentication: "token", "app", "oauth", or "anonymous"
    #[serde(default = "default_auth_mode")]
    pub auth_mode: String,
    pub api_token: Option<String>,
    pub app_id: Option<String>,
    pub app_installation_id: Option<String>,
    /// PEM-encoded RSA private key for app-auth assertion signing.
    pub app_private_key: Option<String>,

    // Rate limiting
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_rate_limit_wait_ms")]
    pub rate_limit_wait_ms: u64,

    // Bulkhead
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_bulkhead_wait_ms")]
    pub bulkhead_wait_ms: u64,

    // Circuit breaker
    #[serde(default = "default_circuit_failure_ratio")]
    pub circuit_failure_ratio: f64,
    #[serde(default = "default_circuit_min_samples")]
    pub circuit_min_samples: u32,
    #[serde(default = "default_circuit_reset_secs")]
    pub circuit_reset_secs: u64,
    #[serde(default = "default_circuit_half_open_probes")]
    pub circuit_half_open_probes: u32,

    // Retry
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    // Timeouts
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    // Conditional-request cache
    #[serde(default = "default_conditional_cache_capacity")]
    pub conditional_cache_capacity: usize,

    // Webhooks
    pub webhook_secret: Option<String>,
    #[serde(default = "default_webhook_queue_capacity")]
    pub webhook_queue_capacity: usize,
    #[serde(default = "default_webhook_workers")]
    pub webhook_workers: usize,
    #[serde(default = "default_webhook_replay_window_secs")]
    pub webhook_replay_window_secs: u64,
    #[serde(default = "default_webhook_max_retries")]
    pub webhook_max_retries: u32,
    #[serde(default = "default_webhook_initial_backoff_ms")]
    pub webhook_initial_backoff_ms: u64,
    #[serde(default = "default_webhook_max_backoff_ms")]
    pub webhook_max_backoff_ms: u64,
    #[serde(default = "default_webhook_backoff_factor")]
    pub webhook_backoff_factor: f64,
    #[serde(default = "default_webhook_jitter_pct")]
    pub webhook_jitter_pct: f64,
    /// Comma-separated CIDR-less IP allow-list; empty disables the check.
    #[serde(default)]
    pub webhook_allowed_ips: Vec<String>,
    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,

    // Database
    pub database_url: Option<String>,
    pub database_read_url: Option<String>,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_db_max_retries")]
    pub db_max_retries: u32,

    // Cache
    pub redis_url: Option<String>,
    #[serde(default = "default_entity_cache_ttl_secs")]
    pub entity_cache_ttl_secs: u64,

    // Metrics server
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_graphql_url() -> String {
    "https://api.github.com/graphql".to_string()
}

fn default_user_agent() -> String {
    format!("mesh-adapter/{}", env!("CARGO_PKG_VERSION"))
}

fn default_auth_mode() -> String {
    "token".to_string()
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    20
}

fn default_rate_limit_wait_ms() -> u64 {
    30_000
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_bulkhead_wait_ms() -> u64 {
    5_000
}

fn default_circuit_failure_ratio() -> f64 {
    0.5
}

fn default_circuit_min_samples() -> u32 {
    10
}

fn default_circuit_reset_secs() -> u64 {
    30
}

fn default_circuit_half_open_probes() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_jitter() -> f64 {
    0.5
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_grace_period_ms() -> u64 {
    1_000
}

fn default_conditional_cache_capacity() -> usize {
    1_024
}

fn default_webhook_queue_capacity() -> usize {
    1_000
}

fn default_webhook_workers() -> usize {
    4
}

fn default_webhook_replay_window_secs() -> u64 {
    3_600
}

fn default_webhook_max_retries() -> u32 {
    5
}

fn default_webhook_initial_backoff_ms() -> u64 {
    1_000
}

fn default_webhook_max_backoff_ms() -> u64 {
    60_000
}

fn default_webhook_backoff_factor() -> f64 {
    2.0
}

fn default_webhook_jitter_pct() -> f64 {
    0.1
}

fn default_webhook_port() -> u16 {
    8081
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_db_max_retries() -> u32 {
    3
}

fn default_entity_cache_ttl_secs() -> u64 {
    300
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_enabled() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        // Build config from environment
        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("webhook_allowed_ips"),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Validates cross-field requirements.
    pub fn validate(&self) -> Result<()> {
        match self.auth_mode.as_str() {
            "token" | "oauth" => {
                if self.api_token.is_none() {
                    anyhow::bail!("auth_mode={} requires api_token", self.auth_mode);
                }
            }
            "app" => {
                if self.app_id.is_none() || self.app_private_key.is_none() {
                    anyhow::bail!("auth_mode=app requires app_id and app_private_key");
                }
            }
            "anonymous" => {}
            other => anyhow::bail!("unknown auth_mode: {}", other),
        }
        if self.requests_per_second <= 0.0 {
            anyhow::bail!("requests_per_second must be positive");
        }
        if !(0.0..=1.0).contains(&self.circuit_failure_ratio) {
            anyhow::bail!("circuit_failure_ratio must be within [0, 1]");
        }
        Ok(())
    }

    pub fn has_webhook_secret(&self) -> bool {
        self.webhook_secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn has_database(&self) -> bool {
        self.database_url.is_some()
    }

    pub fn has_redis(&self) -> bool {
        self.redis_url.is_some()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            graphql_url: default_graphql_url(),
            user_agent: default_user_agent(),
            auth_mode: "anonymous".to_string(),
            api_token: None,
            app_id: None,
            app_installation_id: None,
            app_private_key: None,
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            rate_limit_wait_ms: default_rate_limit_wait_ms(),
            max_concurrent_requests: default_max_concurrent_requests(),
            bulkhead_wait_ms: default_bulkhead_wait_ms(),
            circuit_failure_ratio: default_circuit_failure_ratio(),
            circuit_min_samples: default_circuit_min_samples(),
            circuit_reset_secs: default_circuit_reset_secs(),
            circuit_half_open_probes: default_circuit_half_open_probes(),
            max_retries: default_max_retries(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_jitter: default_retry_jitter(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
            conditional_cache_capacity: default_conditional_cache_capacity(),
            webhook_secret: None,
            webhook_queue_capacity: default_webhook_queue_capacity(),
            webhook_workers: default_webhook_workers(),
            webhook_replay_window_secs: default_webhook_replay_window_secs(),
            webhook_max_retries: default_webhook_max_retries(),
            webhook_initial_backoff_ms: default_webhook_initial_backoff_ms(),
            webhook_max_backoff_ms: default_webhook_max_backoff_ms(),
            webhook_backoff_factor: default_webhook_backoff_factor(),
            webhook_jitter_pct: default_webhook_jitter_pct(),
            webhook_allowed_ips: Vec::new(),
            webhook_port: default_webhook_port(),
            database_url: None,
            database_read_url: None,
            db_max_connections: default_db_max_connections(),
            query_timeout_ms: default_query_timeout_ms(),
            db_max_retries: default_db_max_retries(),
            redis_url: None,
            entity_cache_ttl_secs: default_entity_cache_ttl_secs(),
            metrics_port: default_metrics_port(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.api_base_url, "https://api.github.com");
        assert_eq!(config.requests_per_second, 10.0);
        assert_eq!(config.max_concurrent_requests, 10);
        assert_eq!(config.webhook_queue_capacity, 1_000);
    }

    #[test]
    fn test_validate_token_mode_requires_token() {
        let config = Config {
            auth_mode: "token".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            auth_mode: "token".to_string(),
            api_token: Some("ghp_test".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_app_mode_requires_key() {
        let config = Config {
            auth_mode: "app".to_string(),
            app_id: Some("12345".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_anonymous_ok() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }
}
