//! Prometheus Metrics for the Adapter and Persistence Cores
//!
//! Metrics include:
//! - upstream request counts/latency per operation and status
//! - rate limiter effective rate and waits
//! - bulkhead occupancy and rejections
//! - circuit breaker state and trips
//! - cache hit/miss/error counts and latency
//! - database query latency, transaction commit/rollback counters
//! - webhook queue depth, processed/failed/retried deliveries

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec,
    register_int_gauge_vec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec,
    IntGaugeVec, TextEncoder,
};
use tracing::{error, info};

// ============================================
// METRIC DEFINITIONS
// ============================================

static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "adapter_http_requests_total",
        "Total upstream HTTP requests by method and status class",
        &["method", "status"]
    )
    .expect("Failed to create http_requests metric")
});

static HTTP_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
    register_histogram_vec!(
        HistogramOpts::new(
            "adapter_http_latency_seconds",
            "Latency of upstream HTTP requests"
        )
        .buckets(buckets),
        &["method"]
    )
    .expect("Failed to create http_latency metric")
});

static CONDITIONAL_CACHE: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "adapter_conditional_cache_total",
        "Conditional-request cache outcomes",
        &["outcome"]
    )
    .expect("Failed to create conditional_cache metric")
});

static RATE_LIMIT_EFFECTIVE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "adapter_rate_limit_effective_rps",
        "Current effective request rate after remote feedback",
        &["limiter"]
    )
    .expect("Failed to create rate_limit_effective metric")
});

static RATE_LIMIT_WAITS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "adapter_rate_limit_waits_total",
        "Rate limiter wait outcomes",
        &["limiter", "outcome"]
    )
    .expect("Failed to create rate_limit_waits metric")
});

static BULKHEAD_IN_FLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "adapter_bulkhead_in_flight",
        "Current executions inside the bulkhead",
        &["bulkhead"]
    )
    .expect("Failed to create bulkhead_in_flight metric")
});

static BULKHEAD_REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "adapter_bulkhead_rejections_total",
        "Executions rejected because no slot freed within max wait",
        &["bulkhead"]
    )
    .expect("Failed to create bulkhead_rejections metric")
});

static CIRCUIT_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "adapter_circuit_state",
        "Circuit state (0=closed, 1=open, 2=half-open)",
        &["circuit"]
    )
    .expect("Failed to create circuit_state metric")
});

static CIRCUIT_TRIPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "adapter_circuit_trips_total",
        "Number of closed-to-open transitions",
        &["circuit"]
    )
    .expect("Failed to create circuit_trips metric")
});

static CACHE_OPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "adapter_cache_operations_total",
        "Entity cache operations by outcome",
        &["operation", "outcome"]
    )
    .expect("Failed to create cache_ops metric")
});

static CACHE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25];
    register_histogram_vec!(
        HistogramOpts::new(
            "adapter_cache_latency_seconds",
            "Latency of entity cache operations"
        )
        .buckets(buckets),
        &["operation"]
    )
    .expect("Failed to create cache_latency metric")
});

static DB_QUERY_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];
    register_histogram_vec!(
        HistogramOpts::new(
            "repository_query_latency_seconds",
            "Latency of repository queries"
        )
        .buckets(buckets),
        &["operation"]
    )
    .expect("Failed to create db_query_latency metric")
});

static DB_QUERY_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "repository_query_errors_total",
        "Repository query errors by operation and kind",
        &["operation", "kind"]
    )
    .expect("Failed to create db_query_errors metric")
});

static TRANSACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "repository_transactions_total",
        "Transaction outcomes",
        &["outcome"]
    )
    .expect("Failed to create transactions metric")
});

static TRANSACTION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];
    register_histogram_vec!(
        HistogramOpts::new(
            "repository_transaction_duration_seconds",
            "Wall time from begin to commit or rollback"
        )
        .buckets(buckets),
        &["outcome"]
    )
    .expect("Failed to create transaction_duration metric")
});

static WEBHOOK_QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "webhook_queue_depth",
        "Deliveries waiting in the webhook queue",
        &["queue"]
    )
    .expect("Failed to create webhook_queue_depth metric")
});

static WEBHOOK_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "webhook_events_total",
        "Webhook deliveries by event kind and outcome",
        &["event", "outcome"]
    )
    .expect("Failed to create webhook_events metric")
});

static WEBHOOK_ACTIVE_WORKERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "webhook_active_workers",
        "Workers currently processing a delivery",
        &["queue"]
    )
    .expect("Failed to create webhook_active_workers metric")
});

static WEBHOOK_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "webhook_retries_total",
        "Webhook redeliveries scheduled by the retry manager",
        &["event"]
    )
    .expect("Failed to create webhook_retries metric")
});

// ============================================
// METRICS API
// ============================================

pub fn record_http_request(method: &str, status: u16) {
    let class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    HTTP_REQUESTS.with_label_values(&[method, class]).inc();
}

pub fn record_http_latency(method: &str, latency_secs: f64) {
    HTTP_LATENCY.with_label_values(&[method]).observe(latency_secs);
}

pub fn record_conditional_cache(outcome: &str) {
    CONDITIONAL_CACHE.with_label_values(&[outcome]).inc();
}

pub fn set_effective_rate(limiter: &str, rps: f64) {
    RATE_LIMIT_EFFECTIVE.with_label_values(&[limiter]).set(rps);
}

pub fn record_rate_limit_wait(limiter: &str, outcome: &str) {
    RATE_LIMIT_WAITS.with_label_values(&[limiter, outcome]).inc();
}

pub fn set_bulkhead_in_flight(bulkhead: &str, in_flight: i64) {
    BULKHEAD_IN_FLIGHT.with_label_values(&[bulkhead]).set(in_flight);
}

pub fn record_bulkhead_rejection(bulkhead: &str) {
    BULKHEAD_REJECTIONS.with_label_values(&[bulkhead]).inc();
}

pub fn set_circuit_state(circuit: &str, state: i64) {
    CIRCUIT_STATE.with_label_values(&[circuit]).set(state);
}

pub fn record_circuit_trip(circuit: &str) {
    CIRCUIT_TRIPS.with_label_values(&[circuit]).inc();
}

pub fn record_cache_op(operation: &str, outcome: &str) {
    CACHE_OPS.with_label_values(&[operation, outcome]).inc();
}

pub fn record_cache_latency(operation: &str, latency_secs: f64) {
    CACHE_LATENCY.with_label_values(&[operation]).observe(latency_secs);
}

pub fn record_query_latency(operation: &str, latency_secs: f64) {
    DB_QUERY_LATENCY.with_label_values(&[operation]).observe(latency_secs);
}

pub fn record_query_error(operation: &str, kind: &str) {
    DB_QUERY_ERRORS.with_label_values(&[operation, kind]).inc();
}

pub fn record_transaction(outcome: &str, duration_secs: f64) {
    TRANSACTIONS.with_label_values(&[outcome]).inc();
    TRANSACTION_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

pub fn set_webhook_queue_depth(queue: &str, depth: i64) {
    WEBHOOK_QUEUE_DEPTH.with_label_values(&[queue]).set(depth);
}

pub fn record_webhook_event(event: &str, outcome: &str) {
    WEBHOOK_EVENTS.with_label_values(&[event, outcome]).inc();
}

pub fn inc_webhook_active_workers(queue: &str) {
    WEBHOOK_ACTIVE_WORKERS.with_label_values(&[queue]).inc();
}

pub fn dec_webhook_active_workers(queue: &str) {
    WEBHOOK_ACTIVE_WORKERS.with_label_values(&[queue]).dec();
}

pub fn record_webhook_retry(event: &str) {
    WEBHOOK_RETRIES.with_label_values(&[event]).inc();
}

// ============================================
// METRICS COLLECTION
// ============================================

/// Collects all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

/// A drop-guard timer recording into a latency histogram on scope exit.
pub struct OpTimer {
    operation: &'static str,
    target: TimerTarget,
    start: std::time::Instant,
}

pub enum TimerTarget {
    Http,
    Cache,
    Query,
}

impl OpTimer {
    pub fn new(operation: &'static str, target: TimerTarget) -> Self {
        Self {
            operation,
            target,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for OpTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        match self.target {
            TimerTarget::Http => record_http_latency(self.operation, elapsed),
            TimerTarget::Cache => record_cache_latency(self.operation, elapsed),
            TimerTarget::Query => record_query_latency(self.operation, elapsed),
        }
    }
}

// ============================================
// METRICS SERVER
// ============================================

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Handles metrics HTTP requests
async fn handle_metrics(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let metrics = gather_metrics();
    Ok(Response::new(Full::new(Bytes::from(metrics))))
}

/// Starts the metrics HTTP server
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics))
                .await
            {
                error!(error = %e, "Metrics connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics_includes_registered_families() {
        record_http_request("GET", 200);
        record_http_request("GET", 404);
        set_effective_rate("github", 4.5);
        record_transaction("commit", 0.012);

        let text = gather_metrics();
        assert!(text.contains("adapter_http_requests_total"));
        assert!(text.contains("adapter_rate_limit_effective_rps"));
        assert!(text.contains("repository_transactions_total"));
    }

    #[test]
    fn test_op_timer_records_on_drop() {
        {
            let _t = OpTimer::new("GET", TimerTarget::Http);
        }
        let text = gather_metrics();
        assert!(text.contains("adapter_http_latency_seconds"));
    }
}
