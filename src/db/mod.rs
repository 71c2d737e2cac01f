//! Persistence core
//!
//! Repositories over a read/write-split Postgres pair with an entity cache
//! in front. The [`base`] module carries the shared scaffolding
//! (transactions, statement cache, error translation, query retry); domain
//! repositories compose it.

pub mod base;
pub mod cache;
pub mod document;
pub mod entities;
pub mod task;
pub mod tx;
pub mod workflow;
pub mod workspace;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

pub use base::{BaseRepository, BaseRepositoryConfig, IsolationLevel, TransactionOptions};
pub use cache::{Cache, MemoryCache, RedisCache};
pub use document::DocumentRepository;
pub use task::TaskRepository;
pub use tx::Transaction;
pub use workflow::WorkflowRepository;
pub use workspace::WorkspaceRepository;

/// Listing options shared by the domain repositories.
///
/// Pagination is either offset-based or cursor-based on the
/// `(created_at, id)` tuple; a set cursor wins over the offset.
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Requested sort column; unknown columns fall back to the repo default.
    pub sort_by: Option<String>,
    pub descending: bool,
    pub limit: i64,
    pub offset: Option<i64>,
    pub cursor: Option<(DateTime<Utc>, Uuid)>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            sort_by: None,
            descending: false,
            limit: 50,
            offset: None,
            cursor: None,
        }
    }
}

/// Writer/reader pool pair. Writes always go to the writer; reads prefer
/// the reader replica when one is configured.
#[derive(Clone)]
pub struct Database {
    writer: PgPool,
    reader: Option<PgPool>,
}

impl Database {
    pub async fn connect(
        writer_url: &str,
        reader_url: Option<&str>,
        max_connections: u32,
    ) -> Result<Self> {
        info!("Connecting to database...");

        let writer = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(writer_url)
            .await?;

        let reader = match reader_url {
            Some(url) => {
                info!("Connecting to read replica...");
                Some(
                    PgPoolOptions::new()
                        .max_connections(max_connections)
                        .connect(url)
                        .await?,
                )
            }
            None => None,
        };

        info!(read_replica = reader.is_some(), "Database connected");

        Ok(Self { writer, reader })
    }

    /// Wraps existing pools; used by tests.
    pub fn from_pools(writer: PgPool, reader: Option<PgPool>) -> Self {
        Self { writer, reader }
    }

    pub fn writer(&self) -> &PgPool {
        &self.writer
    }

    /// The reader replica, or the writer when no replica is configured.
    pub fn reader(&self) -> &PgPool {
        self.reader.as_ref().unwrap_or(&self.writer)
    }

    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }
}
