//! Adaptive Rate Limiter
//!
//! Token bucket whose effective rate follows the remote quota advertised in
//! `X-RateLimit-*` response headers. The configured rate is the ceiling;
//! observed headroom shrinks the effective rate ahead of a 429 instead of
//! after one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ErrorKind, MeshError, Result};
use crate::metrics;

/// Minimum effective rate: one request per minute.
const MIN_RATE: f64 = 1.0 / 60.0;

/// Fraction of the remote budget the limiter will spend.
const SAFETY_FACTOR: f64 = 0.9;

/// Usage ratio above which the rate is scaled down further.
const HIGH_USAGE_THRESHOLD: f64 = 0.75;

/// Window before the remote reset in which low-headroom callers wait for
/// the reset instead of draining the last tokens.
const RESET_PROXIMITY: Duration = Duration::from_secs(5);

/// Remote quota as parsed from rate-limit response headers.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSnapshot {
    pub limit: u64,
    pub remaining: u64,
    pub reset: DateTime<Utc>,
    pub used: u64,
}

impl RateLimitSnapshot {
    pub fn usage_ratio(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.used as f64 / self.limit as f64
    }
}

/// Configuration for the adaptive rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Configured ceiling in requests per second
    pub requests_per_second: f64,
    /// Burst capacity in tokens
    pub burst: u32,
    /// Maximum time `wait` blocks before failing
    pub max_wait: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
            max_wait: Duration::from_secs(30),
        }
    }
}

struct BucketState {
    effective_rps: f64,
    tokens: f64,
    last_refill: Instant,
    /// Last remote snapshot, with the reset mapped to the monotonic clock.
    snapshot: Option<(RateLimitSnapshot, Instant)>,
}

/// Observable limiter state.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub configured_rps: f64,
    pub burst: u32,
    pub effective_rps: f64,
    pub snapshot: Option<RateLimitSnapshot>,
    pub near_reset: bool,
}

/// Token-bucket limiter with externally-driven rate adjustment.
pub struct AdaptiveRateLimiter {
    name: String,
    config: RateLimiterConfig,
    state: RwLock<BucketState>,
}

impl AdaptiveRateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let name = name.into();
        metrics::set_effective_rate(&name, config.requests_per_second);
        Self {
            name,
            state: RwLock::new(BucketState {
                effective_rps: config.requests_per_second,
                tokens: config.burst as f64,
                last_refill: Instant::now(),
                snapshot: None,
            }),
            config,
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, RateLimiterConfig::default())
    }

    /// Non-blocking: takes a token if one is available.
    pub fn allow(&self) -> bool {
        let mut state = self.state.write();
        Self::refill(&mut state, self.config.burst as f64);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Blocks until a token is available or `max_wait` expires.
    ///
    /// Near the remote reset with little headroom left, sleeps through the
    /// reset (plus a small margin) instead of draining the final tokens.
    pub async fn wait(&self) -> Result<()> {
        self.wait_with_limit(self.config.max_wait).await
    }

    /// `wait` with an explicit cap on the total blocking time.
    pub async fn wait_with_limit(&self, max_wait: Duration) -> Result<()> {
        let deadline = Instant::now() + max_wait;

        loop {
            let sleep_until = {
                let mut state = self.state.write();
                Self::refill(&mut state, self.config.burst as f64);

                if let Some(reset_at) = self.reset_wait_target(&state) {
                    Some(reset_at)
                } else if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    metrics::record_rate_limit_wait(&self.name, "acquired");
                    return Ok(());
                } else {
                    let deficit = 1.0 - state.tokens;
                    let wait = Duration::from_secs_f64(deficit / state.effective_rps);
                    Some(Instant::now() + wait)
                }
            };

            let target = sleep_until.expect("token path returned above");
            if target > deadline {
                metrics::record_rate_limit_wait(&self.name, "exhausted");
                warn!(
                    limiter = %self.name,
                    max_wait_ms = max_wait.as_millis() as u64,
                    "Rate limit wait exhausted"
                );
                return Err(MeshError::new(
                    ErrorKind::RateLimitExceeded,
                    "rate limit wait exhausted",
                )
                .with_context("limiter", &self.name));
            }

            tokio::time::sleep_until(target).await;
        }
    }

    /// Consumes a remote quota snapshot and adjusts the effective rate.
    ///
    /// `rps = remaining / seconds_until_reset * 0.9`, clamped to
    /// `[1/60, configured]`. Above 75% usage the rate is scaled down along
    /// a linear curve reaching 0.5x at full usage, and never relaxes until
    /// a snapshot with lower usage arrives. Snapshots whose reset is in the
    /// past leave the state unchanged.
    pub fn adjust_rate_limit(&self, snapshot: RateLimitSnapshot) {
        let now_utc = Utc::now();
        let until_reset = snapshot.reset - now_utc;
        let secs = until_reset.num_milliseconds() as f64 / 1_000.0;
        if secs <= 0.0 {
            debug!(limiter = %self.name, "Ignoring stale rate-limit snapshot");
            return;
        }

        let mut rps = snapshot.remaining as f64 / secs * SAFETY_FACTOR;

        let usage = snapshot.usage_ratio();
        let high_usage = usage > HIGH_USAGE_THRESHOLD;
        if high_usage {
            let factor = (1.0 - (usage - HIGH_USAGE_THRESHOLD) * 2.0).max(0.5);
            rps *= factor;
        }

        rps = rps.clamp(MIN_RATE, self.config.requests_per_second);

        let reset_instant =
            Instant::now() + Duration::from_secs_f64(secs);

        let mut state = self.state.write();
        if high_usage {
            // Monotonic shrink under pressure until a relaxing snapshot.
            let previously_high = state
                .snapshot
                .as_ref()
                .is_some_and(|(s, _)| s.usage_ratio() > HIGH_USAGE_THRESHOLD);
            if previously_high {
                rps = rps.min(state.effective_rps);
            }
        }

        debug!(
            limiter = %self.name,
            remaining = snapshot.remaining,
            used = snapshot.used,
            limit = snapshot.limit,
            effective_rps = rps,
            "Adjusted rate limit from remote snapshot"
        );

        state.effective_rps = rps;
        state.snapshot = Some((snapshot, reset_instant));
        metrics::set_effective_rate(&self.name, rps);
    }

    /// Snapshot of the limiter for health/observability surfaces.
    pub fn state(&self) -> RateLimitState {
        let state = self.state.read();
        RateLimitState {
            configured_rps: self.config.requests_per_second,
            burst: self.config.burst,
            effective_rps: state.effective_rps,
            snapshot: state.snapshot.as_ref().map(|(s, _)| s.clone()),
            near_reset: self.reset_wait_target(&state).is_some(),
        }
    }

    pub fn effective_rate(&self) -> f64 {
        self.state.read().effective_rps
    }

    fn refill(state: &mut BucketState, burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.effective_rps).min(burst);
        state.last_refill = now;
    }

    /// When the remote window is about to reset and headroom is nearly
    /// gone, returns the instant to sleep until (reset + 100 ms).
    fn reset_wait_target(&self, state: &BucketState) -> Option<Instant> {
        let (snapshot, reset_instant) = state.snapshot.as_ref()?;
        let now = Instant::now();
        if *reset_instant <= now {
            return None;
        }
        let until_reset = *reset_instant - now;
        let low_headroom = snapshot.remaining < self.config.burst as u64;
        if until_reset < RESET_PROXIMITY && low_headroom {
            Some(*reset_instant + Duration::from_millis(100))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rps: f64, burst: u32) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(
            "test",
            RateLimiterConfig {
                requests_per_second: rps,
                burst,
                max_wait: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn test_allow_consumes_burst() {
        let rl = limiter(1.0, 3);
        assert!(rl.allow());
        assert!(rl.allow());
        assert!(rl.allow());
        assert!(!rl.allow());
    }

    #[tokio::test]
    async fn test_wait_acquires_token() {
        let rl = limiter(100.0, 1);
        rl.wait().await.unwrap();
        // Second token needs ~10ms of refill; should still make the deadline.
        rl.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_fails_past_deadline() {
        let rl = limiter(0.1, 1);
        rl.wait_with_limit(Duration::from_millis(50)).await.unwrap();
        let err = rl
            .wait_with_limit(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimitExceeded);
    }

    #[test]
    fn test_adjust_shrinks_under_high_usage() {
        let rl = limiter(10.0, 20);
        rl.adjust_rate_limit(RateLimitSnapshot {
            limit: 5000,
            remaining: 400,
            reset: Utc::now() + chrono::Duration::seconds(60),
            used: 4600,
        });
        // 400/60 * 0.9 = 6.0, usage 0.92 -> factor 0.66 -> ~3.96
        let effective = rl.effective_rate();
        assert!(effective < 6.0, "effective = {}", effective);
        assert!(effective <= 4.0, "effective = {}", effective);
        assert!(effective >= MIN_RATE);
    }

    #[test]
    fn test_adjust_monotonic_shrink_until_relaxed() {
        let rl = limiter(10.0, 20);
        let reset = Utc::now() + chrono::Duration::seconds(60);
        rl.adjust_rate_limit(RateLimitSnapshot {
            limit: 5000,
            remaining: 1000,
            reset,
            used: 4000,
        });
        let first = rl.effective_rate();

        // Higher usage, same window: must be strictly tighter.
        rl.adjust_rate_limit(RateLimitSnapshot {
            limit: 5000,
            remaining: 400,
            reset,
            used: 4600,
        });
        let second = rl.effective_rate();
        assert!(second < first, "{} >= {}", second, first);

        // A relaxing snapshot lifts the rate again.
        rl.adjust_rate_limit(RateLimitSnapshot {
            limit: 5000,
            remaining: 4900,
            reset: Utc::now() + chrono::Duration::seconds(3600),
            used: 100,
        });
        assert!(rl.effective_rate() > second);
    }

    #[test]
    fn test_stale_snapshot_ignored() {
        let rl = limiter(10.0, 20);
        let before = rl.effective_rate();
        rl.adjust_rate_limit(RateLimitSnapshot {
            limit: 5000,
            remaining: 1,
            reset: Utc::now() - chrono::Duration::seconds(10),
            used: 4999,
        });
        assert_eq!(rl.effective_rate(), before);
    }

    #[test]
    fn test_clamped_to_floor_and_ceiling() {
        let rl = limiter(5.0, 10);
        // Tiny remaining budget over a long window: clamps to the floor.
        rl.adjust_rate_limit(RateLimitSnapshot {
            limit: 5000,
            remaining: 0,
            reset: Utc::now() + chrono::Duration::seconds(3600),
            used: 5000,
        });
        assert!(rl.effective_rate() >= MIN_RATE);

        // Huge budget: clamps to the configured ceiling.
        rl.adjust_rate_limit(RateLimitSnapshot {
            limit: 100_000,
            remaining: 100_000,
            reset: Utc::now() + chrono::Duration::seconds(10),
            used: 0,
        });
        assert_eq!(rl.effective_rate(), 5.0);
    }

    #[test]
    fn test_state_exposes_snapshot() {
        let rl = limiter(10.0, 20);
        assert!(rl.state().snapshot.is_none());
        rl.adjust_rate_limit(RateLimitSnapshot {
            limit: 5000,
            remaining: 2500,
            reset: Utc::now() + chrono::Duration::seconds(600),
            used: 2500,
        });
        let state = rl.state();
        assert_eq!(state.snapshot.unwrap().remaining, 2500);
        assert_eq!(state.configured_rps, 10.0);
    }
}
