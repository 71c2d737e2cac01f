//! Error types for the Mesh Adapter
//!
//! Every error carries a closed [`ErrorKind`], a message, and a free-form
//! key/value context map. The kind drives retry classification and the
//! HTTP-facing code; the context preserves resource/operation details and
//! the upstream error envelope when one was returned.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Closed set of error kinds understood across the adapter and the
/// persistence core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    Validation,
    Unauthorized,
    Forbidden,
    Conflict,
    RateLimitExceeded,
    Upstream,
    Timeout,
    Canceled,
    CircuitOpen,
    OptimisticLock,
    QueueFull,
    BulkheadRejected,
    InvalidAuth,
    InvalidSignature,
    ReplayDetected,
    InvalidSource,
    CacheMiss,
    Internal,
}

impl ErrorKind {
    /// Stable string form used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::Validation => "validation",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::OptimisticLock => "optimistic_lock",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::BulkheadRejected => "bulkhead_rejected",
            ErrorKind::InvalidAuth => "invalid_auth",
            ErrorKind::InvalidSignature => "invalid_signature",
            ErrorKind::ReplayDetected => "replay_detected",
            ErrorKind::InvalidSource => "invalid_source",
            ErrorKind::CacheMiss => "cache_miss",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The adapter-wide error type.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct MeshError {
    pub kind: ErrorKind,
    pub message: String,
    /// Structured context: resource, operation, status_code, constraint, ...
    pub context: BTreeMap<String, String>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Explicit opt-in marker for retry; see [`MeshError::is_retryable`].
    retryable_override: Option<bool>,
}

impl MeshError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
            source: None,
            retryable_override: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn with_resource(self, resource: impl fmt::Display) -> Self {
        self.with_context("resource", resource)
    }

    pub fn with_operation(self, operation: impl fmt::Display) -> Self {
        self.with_context("operation", operation)
    }

    pub fn with_status(self, status: u16) -> Self {
        self.with_context("status_code", status)
    }

    /// Marks this error retryable (or not), overriding the kind-based
    /// classification.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable_override = Some(retryable);
        self
    }

    /// HTTP status code recorded when the error came off the wire.
    pub fn status_code(&self) -> Option<u16> {
        self.context.get("status_code").and_then(|s| s.parse().ok())
    }

    /// Retry classification.
    ///
    /// Transient upstream failures, timeouts, and rate limits are
    /// retryable. Validation, auth, not-found, duplicates, optimistic-lock
    /// misses, and cancellation never are. 4xx statuses are non-retryable
    /// except 408 and 429.
    pub fn is_retryable(&self) -> bool {
        if let Some(explicit) = self.retryable_override {
            return explicit;
        }
        match self.kind {
            ErrorKind::Upstream | ErrorKind::Timeout | ErrorKind::RateLimitExceeded => {
                match self.status_code() {
                    Some(code) if (400..500).contains(&code) => code == 408 || code == 429,
                    _ => true,
                }
            }
            ErrorKind::BulkheadRejected | ErrorKind::CircuitOpen => false,
            ErrorKind::NotFound
            | ErrorKind::Duplicate
            | ErrorKind::Validation
            | ErrorKind::Unauthorized
            | ErrorKind::Forbidden
            | ErrorKind::Conflict
            | ErrorKind::OptimisticLock
            | ErrorKind::InvalidAuth
            | ErrorKind::InvalidSignature
            | ErrorKind::ReplayDetected
            | ErrorKind::InvalidSource
            | ErrorKind::Canceled
            | ErrorKind::QueueFull
            | ErrorKind::CacheMiss
            | ErrorKind::Internal => false,
        }
    }

    // Shorthand constructors for the common kinds.

    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{} {} not found", resource, id))
            .with_resource(resource)
            .with_context("id", id)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn optimistic_lock(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::OptimisticLock,
            format!("{} {} was modified concurrently", resource, id),
        )
        .with_resource(resource)
        .with_context("id", id)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn circuit_open(name: impl fmt::Display) -> Self {
        Self::new(ErrorKind::CircuitOpen, format!("circuit {} is open", name))
            .with_context("circuit", name)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cache_miss(key: impl fmt::Display) -> Self {
        Self::new(ErrorKind::CacheMiss, format!("cache miss for {}", key))
            .with_context("key", key)
    }
}

impl From<reqwest::Error> for MeshError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::Upstream
        };
        let mut e = MeshError::new(kind, format!("http transport error: {}", err));
        if let Some(status) = err.status() {
            e = e.with_status(status.as_u16());
        }
        e.with_source(err)
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::new(ErrorKind::Validation, format!("json error: {}", err)).with_source(err)
    }
}

impl From<sqlx::Error> for MeshError {
    /// Maps driver errors onto domain kinds. Postgres SQLSTATEs: unique
    /// violation 23505 -> Duplicate, foreign-key 23503 / not-null 23502 /
    /// check 23514 -> Validation, serialization failure 40001 ->
    /// OptimisticLock.
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => {
                MeshError::new(ErrorKind::NotFound, "row not found").with_source(err)
            }
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                let constraint = db_err.constraint().map(String::from);

                let kind = match code.as_str() {
                    "23505" => ErrorKind::Duplicate,
                    "23503" | "23502" | "23514" => ErrorKind::Validation,
                    "40001" => ErrorKind::OptimisticLock,
                    _ => ErrorKind::Internal,
                };

                let mut translated =
                    MeshError::new(kind, format!("database error: {}", db_err));
                if !code.is_empty() {
                    translated = translated.with_context("sqlstate", code);
                }
                if let Some(constraint) = constraint {
                    translated = translated.with_context("constraint", constraint);
                }
                translated.with_source(err)
            }
            _ => MeshError::new(ErrorKind::Internal, format!("database error: {}", err))
                .with_source(err),
        }
    }
}

impl From<redis::RedisError> for MeshError {
    fn from(err: redis::RedisError) -> Self {
        MeshError::new(ErrorKind::Internal, format!("redis error: {}", err)).with_source(err)
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MeshError::upstream("502 from upstream").is_retryable());
        assert!(MeshError::timeout("deadline exceeded").is_retryable());
        assert!(!MeshError::validation("bad field").is_retryable());
        assert!(!MeshError::canceled("caller went away").is_retryable());
        assert!(!MeshError::not_found("task", "t1").is_retryable());
        assert!(!MeshError::optimistic_lock("workflow", "w1").is_retryable());
    }

    #[test]
    fn test_4xx_not_retryable_except_408_429() {
        let e = MeshError::upstream("client error").with_status(422);
        assert!(!e.is_retryable());

        let e = MeshError::upstream("request timeout").with_status(408);
        assert!(e.is_retryable());

        let e = MeshError::new(ErrorKind::RateLimitExceeded, "slow down").with_status(429);
        assert!(e.is_retryable());
    }

    #[test]
    fn test_retryable_override() {
        let e = MeshError::internal("flaky dependency").retryable(true);
        assert!(e.is_retryable());

        let e = MeshError::upstream("poison pill").retryable(false);
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_context_round_trip() {
        let e = MeshError::not_found("workflow", "abc")
            .with_operation("GetWorkflow")
            .with_status(404);
        assert_eq!(e.context.get("resource").map(String::as_str), Some("workflow"));
        assert_eq!(e.status_code(), Some(404));
        assert_eq!(e.kind.as_str(), "not_found");
    }
}
