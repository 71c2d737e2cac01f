//! Circuit Breaker Pattern
//!
//! Prevents cascading failures by failing fast once the observed failure
//! ratio over a rolling sample window crosses the configured threshold.
//! States: Closed (normal) -> Open (failing fast) -> HalfOpen (probing)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, MeshError, Result};
use crate::metrics;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Failing - requests are rejected without executing
    Open,
    /// Testing - a bounded number of probe requests allowed
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Decides whether an error counts as a circuit failure.
///
/// Cancellation and not-found are business outcomes, not dependency
/// failures, so the default classifier ignores them.
pub type FailurePredicate = Arc<dyn Fn(&MeshError) -> bool + Send + Sync>;

pub fn default_failure_predicate() -> FailurePredicate {
    Arc::new(|err: &MeshError| {
        !matches!(err.kind, ErrorKind::Canceled | ErrorKind::NotFound)
    })
}

/// Configuration for the circuit breaker
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Failure ratio over the sample window that trips the circuit
    pub failure_ratio: f64,
    /// Outcomes kept in the rolling window
    pub window_size: usize,
    /// Minimum outcomes in the window before the ratio is evaluated
    pub min_samples: u32,
    /// Duration to keep the circuit open before probing
    pub reset_timeout: Duration,
    /// Maximum concurrent probes allowed while half-open
    pub half_open_max_probes: u32,
    /// Error classifier
    pub failure_predicate: FailurePredicate,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            window_size: 20,
            min_samples: 10,
            reset_timeout: Duration::from_secs(30),
            half_open_max_probes: 3,
            failure_predicate: default_failure_predicate(),
        }
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_ratio", &self.failure_ratio)
            .field("window_size", &self.window_size)
            .field("min_samples", &self.min_samples)
            .field("reset_timeout", &self.reset_timeout)
            .field("half_open_max_probes", &self.half_open_max_probes)
            .finish()
    }
}

struct Inner {
    state: CircuitState,
    /// Rolling window of outcomes; true = failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
}

/// Circuit breaker protecting a single downstream dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    half_open_probes: AtomicU32,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        metrics::set_circuit_state(&name, CircuitState::Closed.gauge_value());
        Self {
            name,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                opened_at: None,
            }),
            config,
            half_open_probes: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Runs `op` under the breaker. Open circuits reject immediately with
    /// `CIRCUIT_OPEN`; half-open circuits admit a bounded number of probes.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.allow_request() {
            return Err(MeshError::circuit_open(&self.name));
        }

        let probing = self.state() == CircuitState::HalfOpen;
        let result = op().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(err) => {
                if (self.config.failure_predicate)(err) {
                    self.record_failure();
                } else if probing {
                    // A non-failure outcome still proves the dependency is
                    // reachable.
                    self.record_success();
                }
            }
        }

        if probing {
            // A manual reset may have cleared the counter mid-probe.
            let _ = self
                .half_open_probes
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }

        result
    }

    /// Gets the current state, transitioning Open -> HalfOpen when the
    /// reset timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks whether a request may proceed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    info!(
                        circuit = %self.name,
                        "Circuit transitioning from Open to HalfOpen"
                    );
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    self.half_open_probes.store(0, Ordering::Relaxed);
                    self.try_probe()
                } else {
                    debug!(circuit = %self.name, "Circuit is Open - request rejected");
                    false
                }
            }
            CircuitState::HalfOpen => self.try_probe(),
        }
    }

    fn try_probe(&self) -> bool {
        let current = self.half_open_probes.fetch_add(1, Ordering::Relaxed);
        if current < self.config.half_open_max_probes {
            debug!(
                circuit = %self.name,
                probe = current + 1,
                max = self.config.half_open_max_probes,
                "Allowing half-open probe"
            );
            true
        } else {
            self.half_open_probes.fetch_sub(1, Ordering::Relaxed);
            false
        }
    }

    /// Records a successful outcome.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => {
                Self::push_outcome(&mut inner.window, false, self.config.window_size);
            }
            CircuitState::HalfOpen => {
                info!(circuit = %self.name, "Probe succeeded - circuit closing");
                inner.window.clear();
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed outcome; may trip the circuit.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => {
                Self::push_outcome(&mut inner.window, true, self.config.window_size);

                let samples = inner.window.len() as u32;
                if samples >= self.config.min_samples {
                    let failures = inner.window.iter().filter(|f| **f).count();
                    let ratio = failures as f64 / samples as f64;
                    if ratio >= self.config.failure_ratio {
                        warn!(
                            circuit = %self.name,
                            ratio = ratio,
                            threshold = self.config.failure_ratio,
                            samples = samples,
                            "Circuit tripped - transitioning to Open"
                        );
                        inner.opened_at = Some(Instant::now());
                        self.transition(&mut inner, CircuitState::Open);
                        self.trips.fetch_add(1, Ordering::Relaxed);
                        metrics::record_circuit_trip(&self.name);
                    }
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    circuit = %self.name,
                    "Probe failed - circuit reopening"
                );
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
                self.trips.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_trip(&self.name);
            }
            CircuitState::Open => {}
        }
    }

    /// Manually trips the circuit.
    pub fn trip(&self) {
        let mut inner = self.inner.write();
        if inner.state != CircuitState::Open {
            warn!(circuit = %self.name, "Circuit manually tripped");
            inner.opened_at = Some(Instant::now());
            self.transition(&mut inner, CircuitState::Open);
            self.trips.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Manually resets the circuit.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        info!(circuit = %self.name, "Circuit manually reset");
        inner.window.clear();
        inner.opened_at = None;
        self.transition(&mut inner, CircuitState::Closed);
        self.half_open_probes.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            trips: self.trips.load(Ordering::Relaxed),
        }
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        inner.state = next;
        metrics::set_circuit_state(&self.name, next.gauge_value());
    }

    fn push_outcome(window: &mut VecDeque<bool>, failed: bool, cap: usize) {
        if window.len() == cap {
            window.pop_front();
        }
        window.push_back(failed);
    }
}

/// Statistics for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub total_failures: u64,
    pub total_successes: u64,
    pub trips: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(min_samples: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_ratio: 0.5,
                window_size: 10,
                min_samples,
                reset_timeout: Duration::from_millis(reset_ms),
                half_open_max_probes: 2,
                failure_predicate: default_failure_predicate(),
            },
        )
    }

    #[test]
    fn test_trips_only_at_failure_ratio() {
        let cb = breaker(4, 1_000);

        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed); // 2/3 but below min samples

        cb.record_failure(); // 3/4 >= 0.5
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_below_ratio_stays_closed() {
        let cb = breaker(4, 1_000);

        for _ in 0..6 {
            cb.record_success();
        }
        cb.record_failure();
        cb.record_failure();
        // 2 failures over 8 samples = 0.25 < 0.5
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_closes_on_probe_success() {
        let cb = breaker(2, 10);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_reopens_on_probe_failure() {
        let cb = breaker(2, 10);

        cb.record_failure();
        cb.record_failure();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_before_reset_timeout_rejects() {
        let cb = breaker(2, 200);
        cb.record_failure();
        cb.record_failure();

        let err = cb
            .execute(|| async { Ok::<_, MeshError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
    }

    #[tokio::test]
    async fn test_not_found_is_not_a_failure() {
        let cb = breaker(2, 1_000);

        for _ in 0..5 {
            let _ = cb
                .execute(|| async { Err::<(), _>(MeshError::not_found("repo", "r1")) })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_execute_records_outcomes() {
        let cb = breaker(2, 1_000);

        let _ = cb
            .execute(|| async { Err::<(), _>(MeshError::upstream("500")) })
            .await;
        let _ = cb
            .execute(|| async { Err::<(), _>(MeshError::upstream("502")) })
            .await;

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().trips, 1);
    }
}
