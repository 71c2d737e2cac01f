//! Entity cache interface
//!
//! Repositories cache serialized entities under deterministic keys. A miss
//! is a distinct sentinel (`CacheMiss`), never an empty value, so callers
//! can tell "absent from cache" from "cached as empty".

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{MeshError, Result};

/// Cache operations used by the repositories.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns the cached bytes or the `CacheMiss` sentinel.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn flush(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Redis-backed cache.
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisCache {
    pub fn new(conn: redis::aio::ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self::new(conn, prefix))
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        value.ok_or_else(|| MeshError::cache_miss(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn flush(&self) -> Result<()> {
        // Scoped flush: delete only this prefix.
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", self.prefix);
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut conn)
            .await?;
        if !keys.is_empty() {
            redis::cmd("DEL").arg(keys).query_async::<()>(&mut conn).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager closes with its last clone.
        Ok(())
    }
}

/// In-memory cache with TTL expiry. The default for tests and single-node
/// deployments.
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn expired(entry: &(Vec<u8>, Option<Instant>)) -> bool {
        entry.1.is_some_and(|at| Instant::now() >= at)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        match inner.get(key) {
            Some(entry) if !Self::expired(entry) => Ok(entry.0.clone()),
            Some(_) => {
                inner.remove(key);
                debug!(key, "Cache entry expired");
                Err(MeshError::cache_miss(key))
            }
            None => Err(MeshError::cache_miss(key)),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.inner
            .lock()
            .insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.get(key) {
            Some(entry) if !Self::expired(entry) => Ok(true),
            Some(_) => {
                inner.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn flush(&self) -> Result<()> {
        self.inner.lock().clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
