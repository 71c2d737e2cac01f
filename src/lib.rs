//! Mesh Adapter
//! Resilient GitHub adapter and persistence core for the Developer Mesh platform
//!
//! Features:
//! - Adaptive token-bucket rate limiting driven by remote quota feedback
//! - Bulkhead, circuit breaker, retry, and timeout primitives
//! - Token / OAuth / app (signed assertion) / passthrough authentication
//! - REST client with conditional-request (ETag) caching
//! - GraphQL client with cursor pagination and batched queries
//! - Webhook intake with signature validation, replay suppression,
//!   bounded queue, worker pool, and retry manager
//! - Read/write-split repositories with optimistic locking, multi-level
//!   caching, and domain error translation
//! - Prometheus metrics and structured tracing throughout

pub mod adapter;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod graphql;
pub mod metrics;
pub mod resilience;
pub mod rest;
pub mod webhook;

pub use config::Config;
pub use error::{ErrorKind, MeshError, Result};
