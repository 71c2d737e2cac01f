//! Replay suppression
//!
//! Delivery-ids are tracked in a bounded time-keyed set; a delivery-id seen
//! again inside the replay window is a replay. Supports an in-memory store
//! and Redis for suppression across instances.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

/// Bounded time-keyed set of recently seen delivery-ids.
pub struct ReplayGuard {
    /// delivery-id -> first-seen instant
    seen: RwLock<HashMap<String, Instant>>,
    /// Replay window; retention is at least this long.
    window: Duration,
    /// Hard bound on tracked ids.
    max_entries: usize,
    /// Redis connection for distributed suppression (optional)
    redis: Option<redis::aio::ConnectionManager>,
}

impl ReplayGuard {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            seen: RwLock::new(HashMap::with_capacity(max_entries.min(4_096))),
            window,
            max_entries,
            redis: None,
        }
    }

    /// Creates a guard with a Redis backend; the in-memory set remains the
    /// fallback when Redis is unreachable.
    pub fn with_redis(
        window: Duration,
        max_entries: usize,
        redis: redis::aio::ConnectionManager,
    ) -> Self {
        Self {
            seen: RwLock::new(HashMap::with_capacity(max_entries.min(4_096))),
            window,
            max_entries,
            redis: Some(redis),
        }
    }

    /// Checks whether `delivery_id` was already seen inside the window and
    /// records it. Returns true for replays.
    pub async fn check_and_mark(&self, delivery_id: &str) -> bool {
        if let Some(ref redis) = self.redis {
            match self.mark_redis(delivery_id, redis.clone()).await {
                Ok(was_new) => {
                    if !was_new {
                        debug!(delivery_id, "Replay found in Redis");
                        return true;
                    }
                    // Fall through to mirror into memory for fast reads.
                }
                Err(e) => {
                    warn!(error = %e, "Redis replay check failed, falling back to memory");
                }
            }
        }

        let now = Instant::now();
        let mut seen = self.seen.write();

        if let Some(first_seen) = seen.get(delivery_id) {
            if now.duration_since(*first_seen) < self.window {
                debug!(delivery_id, "Replay found in memory");
                return true;
            }
        }

        Self::evict(&mut seen, now, self.window, self.max_entries);
        seen.insert(delivery_id.to_string(), now);
        false
    }

    /// Tracked ids currently in memory.
    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.read().is_empty()
    }

    /// Drops expired entries; under the hard bound, drops the oldest.
    fn evict(
        seen: &mut HashMap<String, Instant>,
        now: Instant,
        window: Duration,
        max_entries: usize,
    ) {
        seen.retain(|_, first_seen| now.duration_since(*first_seen) < window);

        while seen.len() >= max_entries {
            let oldest = seen
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    seen.remove(&id);
                }
                None => break,
            }
        }
    }

    /// SET NX with the window as TTL: true when the id is new.
    async fn mark_redis(
        &self,
        delivery_id: &str,
        mut redis: redis::aio::ConnectionManager,
    ) -> Result<bool, redis::RedisError> {
        let key = format!("webhook:replay:{}", delivery_id);
        let was_set: bool = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.window.as_secs().max(1))
            .query_async(&mut redis)
            .await?;
        Ok(was_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_delivery_accepted_second_rejected() {
        let guard = ReplayGuard::new(Duration::from_secs(60), 1_000);

        assert!(!guard.check_and_mark("D1").await);
        assert!(guard.check_and_mark("D1").await);
    }

    #[tokio::test]
    async fn test_distinct_ids_accepted() {
        let guard = ReplayGuard::new(Duration::from_secs(60), 1_000);

        assert!(!guard.check_and_mark("D1").await);
        assert!(!guard.check_and_mark("D2").await);
        assert_eq!(guard.len(), 2);
    }

    #[tokio::test]
    async fn test_expired_id_accepted_again() {
        let guard = ReplayGuard::new(Duration::from_millis(20), 1_000);

        assert!(!guard.check_and_mark("D1").await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!guard.check_and_mark("D1").await);
    }

    #[tokio::test]
    async fn test_bounded_set_evicts_oldest() {
        let guard = ReplayGuard::new(Duration::from_secs(600), 3);

        assert!(!guard.check_and_mark("D1").await);
        assert!(!guard.check_and_mark("D2").await);
        assert!(!guard.check_and_mark("D3").await);
        assert!(!guard.check_and_mark("D4").await);

        assert!(guard.len() <= 3);
        // The newest id is definitely still tracked.
        assert!(guard.check_and_mark("D4").await);
    }
}
