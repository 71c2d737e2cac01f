//! Savepoint-capable transaction wrapper
//!
//! Thin handle over a Postgres transaction with named savepoints, commit
//! timing, and an idempotent close: operations after commit/rollback fail
//! instead of touching a dead transaction.

use std::time::Instant;

use sqlx::postgres::PgQueryResult;
use sqlx::{PgConnection, Postgres};
use tracing::debug;

use crate::error::{MeshError, Result};
use crate::metrics;

use super::Database;

/// Single-owner transaction handle. Never shared across callers.
pub struct Transaction {
    inner: Option<sqlx::Transaction<'static, Postgres>>,
    savepoints: u32,
    started: Instant,
}

impl Transaction {
    /// Begins a transaction on the writer.
    pub async fn begin(db: &Database) -> Result<Self> {
        let inner = db.writer().begin().await?;
        Ok(Self {
            inner: Some(inner),
            savepoints: 0,
            started: Instant::now(),
        })
    }

    /// The underlying connection, for running queries inside the
    /// transaction.
    pub fn conn(&mut self) -> Result<&mut PgConnection> {
        self.inner
            .as_deref_mut()
            .ok_or_else(|| MeshError::internal("transaction is closed"))
    }

    /// Executes a statement with positional binds.
    pub async fn execute(&mut self, sql: &str) -> Result<PgQueryResult> {
        let conn = self.conn()?;
        sqlx::query(sql).execute(conn).await.map_err(Into::into)
    }

    /// Creates a named savepoint.
    pub async fn savepoint(&mut self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        let conn = self.conn()?;
        sqlx::query(&format!("SAVEPOINT {}", name))
            .execute(conn)
            .await?;
        self.savepoints += 1;
        debug!(savepoint = name, "Savepoint created");
        Ok(())
    }

    /// Rolls back to a named savepoint; the transaction stays usable.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        let conn = self.conn()?;
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .execute(conn)
            .await?;
        debug!(savepoint = name, "Rolled back to savepoint");
        Ok(())
    }

    /// Commits; emits duration and savepoint count. Idempotent: a second
    /// call fails cleanly rather than double-committing.
    pub async fn commit(&mut self) -> Result<()> {
        let inner = self
            .inner
            .take()
            .ok_or_else(|| MeshError::internal("transaction already closed"))?;
        inner.commit().await?;

        let elapsed = self.started.elapsed().as_secs_f64();
        metrics::record_transaction("commit", elapsed);
        debug!(
            duration_ms = (elapsed * 1_000.0) as u64,
            savepoints = self.savepoints,
            "Transaction committed"
        );
        Ok(())
    }

    /// Rolls back; a no-op error after close.
    pub async fn rollback(&mut self) -> Result<()> {
        let inner = self
            .inner
            .take()
            .ok_or_else(|| MeshError::internal("transaction already closed"))?;
        inner.rollback().await?;
        metrics::record_transaction("rollback", self.started.elapsed().as_secs_f64());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    pub fn savepoint_count(&self) -> u32 {
        self.savepoints
    }
}

/// Savepoint names are interpolated into SQL; restrict them to plain
/// identifiers.
fn validate_savepoint_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MeshError::validation(format!(
            "invalid savepoint name: {}",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_name_validation() {
        assert!(validate_savepoint_name("sp1").is_ok());
        assert!(validate_savepoint_name("_step_two").is_ok());
        assert!(validate_savepoint_name("").is_err());
        assert!(validate_savepoint_name("1sp").is_err());
        assert!(validate_savepoint_name("sp; DROP TABLE tasks").is_err());
        assert!(validate_savepoint_name("sp-1").is_err());
    }
}
