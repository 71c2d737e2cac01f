//! REST client for the upstream API
//!
//! - [`client`]: request pipeline with auth, conditional requests,
//!   resilience chain, and typed error translation
//! - [`conditional_cache`]: bounded `(method, url)` -> `{etag, body}` store
//! - [`rate_limit`]: `X-RateLimit-*` header parsing and the feedback
//!   callback wiring

pub mod client;
pub mod conditional_cache;
pub mod rate_limit;

pub use client::{RestClient, RestClientConfig};
pub use conditional_cache::ConditionalCache;
pub use rate_limit::{parse_rate_limit_headers, RateLimitCallback};
