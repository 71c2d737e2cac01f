//! Shared repository scaffolding
//!
//! Domain repositories compose this: transactional execution, a named
//! statement-text cache with double-checked promotion, the entity cache
//! wrappers, Postgres error translation into domain kinds, query timeout +
//! retry, and optional circuit breaking around the pool.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ErrorKind, MeshError, Result};
use crate::metrics;
use crate::resilience::{CircuitBreaker, RetryPolicy};

use super::cache::Cache;
use super::tx::Transaction;
use super::Database;

/// Configuration for the base repository
#[derive(Debug, Clone)]
pub struct BaseRepositoryConfig {
    /// Per-query deadline
    pub query_timeout: Duration,
    /// Attempts for `execute_query_with_retry`
    pub max_retries: u32,
    /// Backoff between retried queries
    pub retry_initial_interval: Duration,
    pub retry_max_interval: Duration,
    /// TTL for cached entities
    pub cache_ttl: Duration,
}

impl Default for BaseRepositoryConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_initial_interval: Duration::from_millis(50),
            retry_max_interval: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Per-transaction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Shared scaffolding owned by every domain repository.
pub struct BaseRepository {
    db: Arc<Database>,
    cache: Option<Arc<dyn Cache>>,
    breaker: Option<Arc<CircuitBreaker>>,
    /// Named statement texts, promoted under the writer lock.
    statements: RwLock<HashMap<String, Arc<str>>>,
    config: BaseRepositoryConfig,
}

impl BaseRepository {
    pub fn new(
        db: Arc<Database>,
        cache: Option<Arc<dyn Cache>>,
        breaker: Option<Arc<CircuitBreaker>>,
        config: BaseRepositoryConfig,
    ) -> Self {
        Self {
            db,
            cache,
            breaker,
            statements: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &BaseRepositoryConfig {
        &self.config
    }

    // ============================================
    // TRANSACTIONS
    // ============================================

    /// Begins a transaction on the writer, runs `f`, and commits; any
    /// error rolls back. A panic inside `f` unwinds through here and the
    /// dropped transaction rolls back on its own.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T>>,
    {
        self.with_transaction_options(TransactionOptions::default(), f)
            .await
    }

    /// `with_transaction` with an explicit isolation level and read-only
    /// flag.
    pub async fn with_transaction_options<T, F>(
        &self,
        opts: TransactionOptions,
        f: F,
    ) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T>>,
    {
        let started = Instant::now();
        let mut tx = Transaction::begin(&self.db).await?;

        if opts.isolation != IsolationLevel::default() || opts.read_only {
            let mode = if opts.read_only { " READ ONLY" } else { "" };
            tx.execute(&format!(
                "SET TRANSACTION ISOLATION LEVEL {}{}",
                opts.isolation.as_sql(),
                mode
            ))
            .await?;
        }

        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed after error");
                    metrics::record_transaction("error", started.elapsed().as_secs_f64());
                }
                Err(err)
            }
        }
    }

    // ============================================
    // STATEMENT CACHE
    // ============================================

    /// Returns the canonical statement text for `name`, building it at
    /// most once. Double-checked: the fast path holds only the read lock.
    pub fn statement<F>(&self, name: &str, build: F) -> Arc<str>
    where
        F: FnOnce() -> String,
    {
        if let Some(found) = self.statements.read().get(name) {
            return found.clone();
        }

        let mut statements = self.statements.write();
        // Re-check: another writer may have promoted while we waited.
        if let Some(found) = statements.get(name) {
            return found.clone();
        }
        let text: Arc<str> = build().into();
        statements.insert(name.to_string(), text.clone());
        debug!(statement = name, "Statement cached");
        text
    }

    pub fn statement_count(&self) -> usize {
        self.statements.read().len()
    }

    // ============================================
    // ENTITY CACHE
    // ============================================

    /// Reads a cached entity. A miss (or no configured cache) propagates
    /// the `CacheMiss` sentinel.
    pub async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let Some(cache) = &self.cache else {
            return Err(MeshError::cache_miss(key));
        };

        let start = Instant::now();
        let result = cache.get(key).await;
        metrics::record_cache_latency("get", start.elapsed().as_secs_f64());

        match result {
            Ok(bytes) => {
                metrics::record_cache_op("get", "hit");
                serde_json::from_slice(&bytes).map_err(Into::into)
            }
            Err(err) if err.kind == ErrorKind::CacheMiss => {
                metrics::record_cache_op("get", "miss");
                Err(err)
            }
            Err(err) => {
                metrics::record_cache_op("get", "error");
                Err(err)
            }
        }
    }

    /// Caches an entity; errors are recorded but not fatal to the caller's
    /// write path.
    pub async fn cache_set<T: Serialize>(&self, key: &str, value: &T) {
        let Some(cache) = &self.cache else { return };

        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "Cache serialization failed");
                return;
            }
        };

        let start = Instant::now();
        match cache.set(key, &bytes, self.config.cache_ttl).await {
            Ok(()) => metrics::record_cache_op("set", "ok"),
            Err(e) => {
                metrics::record_cache_op("set", "error");
                warn!(key, error = %e, "Cache set failed");
            }
        }
        metrics::record_cache_latency("set", start.elapsed().as_secs_f64());
    }

    /// Invalidates a set of cache keys after a write.
    pub async fn cache_delete(&self, keys: &[String]) {
        let Some(cache) = &self.cache else { return };

        for key in keys {
            let start = Instant::now();
            match cache.delete(key).await {
                Ok(()) => metrics::record_cache_op("delete", "ok"),
                Err(e) => {
                    metrics::record_cache_op("delete", "error");
                    warn!(key = %key, error = %e, "Cache invalidation failed");
                }
            }
            metrics::record_cache_latency("delete", start.elapsed().as_secs_f64());
        }
    }

    // ============================================
    // ERROR TRANSLATION
    // ============================================

    /// Maps driver errors to domain kinds (no-rows -> NotFound, unique
    /// violation -> Duplicate, constraint violations -> Validation,
    /// serialization failure -> OptimisticLock) and stamps the entity.
    pub fn translate_error(err: sqlx::Error, entity: &str) -> MeshError {
        MeshError::from(err).with_resource(entity)
    }

    // ============================================
    // QUERY EXECUTION
    // ============================================

    /// Runs a query with the configured deadline, records its latency, and
    /// classifies failures.
    pub async fn execute_query<T, F, Fut>(
        &self,
        operation: &'static str,
        entity: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.config.query_timeout, f()).await;
        metrics::record_query_latency(operation, start.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                let translated = Self::translate_error(err, entity).with_operation(operation);
                metrics::record_query_error(operation, translated.kind.as_str());
                Err(translated)
            }
            Err(_) => {
                metrics::record_query_error(operation, "timeout");
                Err(MeshError::timeout(format!("{} exceeded query timeout", operation))
                    .with_operation(operation)
                    .with_resource(entity))
            }
        }
    }

    /// `execute_query` with bounded retries: each attempt runs the full
    /// timed and metered query path. NotFound, Duplicate, Validation,
    /// optimistic-lock misses, and cancellation never replay.
    pub async fn execute_query_with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        entity: &str,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let policy = RetryPolicy {
            max_attempts: self.config.max_retries.max(1),
            initial_interval: self.config.retry_initial_interval,
            max_interval: self.config.retry_max_interval,
            multiplier: 2.0,
            jitter: 0.25,
        };

        let query_timeout = self.config.query_timeout;
        policy
            .execute(operation, || {
                let fut = f();
                async move {
                    let start = Instant::now();
                    let outcome = tokio::time::timeout(query_timeout, fut).await;
                    metrics::record_query_latency(operation, start.elapsed().as_secs_f64());

                    match outcome {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => {
                            let translated = Self::translate_error(err, entity)
                                .with_operation(operation)
                                .retryable_if_transient();
                            metrics::record_query_error(operation, translated.kind.as_str());
                            Err(translated)
                        }
                        Err(_) => {
                            metrics::record_query_error(operation, "timeout");
                            Err(MeshError::timeout(format!(
                                "{} exceeded query timeout",
                                operation
                            ))
                            .with_operation(operation))
                        }
                    }
                }
            })
            .await
    }

    /// Runs `f` under the repository's circuit breaker; identity when none
    /// is configured.
    pub async fn execute_with_circuit_breaker<T, F, Fut>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match &self.breaker {
            Some(breaker) => {
                debug!(circuit = name, "Executing under circuit breaker");
                breaker.execute(f).await
            }
            None => f().await,
        }
    }

    /// Clears the statement cache.
    pub fn close(&self) {
        self.statements.write().clear();
    }
}

trait RetryableIfTransient {
    fn retryable_if_transient(self) -> MeshError;
}

impl RetryableIfTransient for MeshError {
    /// Internal driver errors (connection drops, pool exhaustion) replay;
    /// the domain kinds keep their default classification.
    fn retryable_if_transient(self) -> MeshError {
        match self.kind {
            ErrorKind::Internal => self.retryable(true),
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_translate_row_not_found() {
        let err = BaseRepository::translate_error(sqlx::Error::RowNotFound, "workflow");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.context.get("resource").map(String::as_str), Some("workflow"));
    }

    #[test]
    fn test_translate_pool_timeout_is_internal() {
        let err = BaseRepository::translate_error(sqlx::Error::PoolTimedOut, "task");
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn test_retryable_if_transient_marks_internal_only() {
        let internal = MeshError::internal("connection reset").retryable_if_transient();
        assert!(internal.is_retryable());

        let not_found = MeshError::not_found("task", "t1").retryable_if_transient();
        assert!(!not_found.is_retryable());
    }

    #[tokio::test]
    async fn test_statement_cache_builds_once() {
        let base = test_base();
        let mut builds = 0;

        let first = base.statement("get_task", || {
            builds += 1;
            "SELECT * FROM tasks WHERE id = $1".to_string()
        });
        let second = base.statement("get_task", || {
            builds += 1;
            unreachable!("statement must be cached")
        });

        assert_eq!(builds, 1);
        assert_eq!(first, second);
        assert_eq!(base.statement_count(), 1);

        base.close();
        assert_eq!(base.statement_count(), 0);
    }

    #[tokio::test]
    async fn test_query_retry_replays_transient_errors_only() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let base = BaseRepository::new(
            Arc::new(Database::from_pools(lazy_pool(), None)),
            None,
            None,
            BaseRepositoryConfig {
                retry_initial_interval: Duration::from_millis(1),
                retry_max_interval: Duration::from_millis(5),
                ..Default::default()
            },
        );

        // Transient driver error replays until it clears.
        let calls = AtomicU32::new(0);
        let value = base
            .execute_query_with_retry("flaky_query", "task", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(sqlx::Error::PoolTimedOut)
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // NotFound is terminal: exactly one attempt.
        let calls = AtomicU32::new(0);
        let err = base
            .execute_query_with_retry("missing_query", "task", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>(sqlx::Error::RowNotFound) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_get_without_cache_is_a_miss() {
        let base = test_base();
        let err = base.cache_get::<serde_json::Value>("task:1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CacheMiss);
    }

    #[tokio::test]
    async fn test_cache_round_trip_with_memory_cache() {
        let base = test_base_with_cache();
        let value = serde_json::json!({"id": "t1", "title": "test"});

        base.cache_set("task:t1", &value).await;
        let cached: serde_json::Value = base.cache_get("task:t1").await.unwrap();
        assert_eq!(cached, value);

        base.cache_delete(&["task:t1".to_string()]).await;
        let err = base.cache_get::<serde_json::Value>("task:t1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CacheMiss);
    }

    fn test_base() -> BaseRepository {
        BaseRepository::new(
            Arc::new(Database::from_pools(lazy_pool(), None)),
            None,
            None,
            BaseRepositoryConfig::default(),
        )
    }

    fn test_base_with_cache() -> BaseRepository {
        BaseRepository::new(
            Arc::new(Database::from_pools(lazy_pool(), None)),
            Some(Arc::new(super::super::cache::MemoryCache::new())),
            None,
            BaseRepositoryConfig::default(),
        )
    }

    /// A pool that never connects; these tests exercise only the
    /// non-database scaffolding.
    fn lazy_pool() -> sqlx::PgPool {
        sqlx::pool::PoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/mesh_test")
            .expect("lazy pool construction does not touch the network")
    }
}
