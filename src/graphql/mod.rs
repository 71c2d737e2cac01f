//! GraphQL client for the upstream API
//!
//! - [`client`]: query executor, `(first, after)` pagination driver, and
//!   batched-query composition

pub mod client;

use std::time::Duration;

pub use client::{BatchQueryItem, BatchQueryResult, GraphQlClient, GraphQlClientConfig};

/// Default page size when `first` is omitted.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Minimum pause between pages so pagination does not burn the quota.
pub const MIN_PAGE_DELAY: Duration = Duration::from_millis(100);

/// Pagination options shared by GraphQL connections and REST listings.
#[derive(Debug, Clone)]
pub struct PaginationOptions {
    /// Page size; `None` means [`DEFAULT_PAGE_SIZE`].
    pub first: Option<u32>,
    /// Cursor to resume from.
    pub after: Option<String>,
    /// Upper bound on pages fetched; `None` means no bound.
    pub max_pages: Option<u32>,
    /// Field naming the connection that carries `pageInfo`.
    pub items_field: Option<String>,
    /// Pause between pages; raised to [`MIN_PAGE_DELAY`] when lower.
    pub page_delay: Duration,
}

impl Default for PaginationOptions {
    fn default() -> Self {
        Self {
            first: None,
            after: None,
            max_pages: None,
            items_field: None,
            page_delay: MIN_PAGE_DELAY,
        }
    }
}

impl PaginationOptions {
    pub fn page_size(&self) -> u32 {
        self.first.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn effective_page_delay(&self) -> Duration {
        self.page_delay.max(MIN_PAGE_DELAY)
    }
}
