//! Task repository
//!
//! Tasks with a fixed status state machine, batched bulk insert over the
//! driver's COPY facility, advisory locks for execution claims, a
//! streaming page iterator, delegations, and an append-only event log.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolCopyExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, MeshError, Result};

use super::base::BaseRepository;
use super::entities::{Task, TaskStatus};
use super::ListOptions;

const COLUMNS: &str = "id, tenant_id, title, description, status, priority, assignee, payload, \
                       tags, workflow_id, started_at, completed_at, version, created_at, \
                       updated_at, deleted_at";

const COPY_COLUMNS: &str = "id, tenant_id, title, description, status, priority, assignee, \
                            payload, tags, workflow_id, version, created_at, updated_at";

const SORT_FIELDS: &[&str] = &["created_at", "updated_at", "priority", "status", "title"];
const DEFAULT_SORT: &str = "created_at";

/// Counts from an integrity sweep.
#[derive(Debug, Clone, Default)]
pub struct TaskIntegrityReport {
    /// Tasks referencing a workflow row that is gone.
    pub orphaned_workflow_refs: i64,
    /// Terminal tasks without a completion timestamp.
    pub terminal_without_timestamp: i64,
    /// Pending tasks that claim a start timestamp.
    pub pending_with_start: i64,
}

/// Repository for tasks.
pub struct TaskRepository {
    base: Arc<BaseRepository>,
}

impl TaskRepository {
    pub fn new(base: Arc<BaseRepository>) -> Self {
        Self { base }
    }

    fn entity_key(tenant_id: Uuid, id: Uuid) -> String {
        format!("task:{}:{}", tenant_id, id)
    }

    fn list_key(tenant_id: Uuid) -> String {
        format!("task:list:{}", tenant_id)
    }

    fn invalidation_keys(tenant_id: Uuid, id: Uuid) -> Vec<String> {
        vec![Self::entity_key(tenant_id, id), Self::list_key(tenant_id)]
    }

    // ============================================
    // CRUD
    // ============================================

    pub async fn create(&self, task: &Task) -> Result<Task> {
        let sql = self.base.statement("task_insert", || {
            format!(
                "INSERT INTO tasks ({COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 1, NOW(), NOW(), NULL) \
                 RETURNING {COLUMNS}"
            )
        });

        let db = self.base.db().clone();
        let created = self
            .base
            .execute_query("task_create", "task", || {
                sqlx::query_as::<_, Task>(&sql)
                    .bind(task.id)
                    .bind(task.tenant_id)
                    .bind(&task.title)
                    .bind(&task.description)
                    .bind(&task.status)
                    .bind(task.priority)
                    .bind(&task.assignee)
                    .bind(&task.payload)
                    .bind(&task.tags)
                    .bind(task.workflow_id)
                    .bind(task.started_at)
                    .bind(task.completed_at)
                    .fetch_one(db.writer())
            })
            .await?;

        self.base.cache_delete(&[Self::list_key(task.tenant_id)]).await;
        self.base
            .cache_set(&Self::entity_key(created.tenant_id, created.id), &created)
            .await;

        Ok(created)
    }

    /// Inserts a batch through `COPY ... FROM STDIN`; one round-trip for
    /// the whole batch. Returns the inserted count.
    pub async fn bulk_create(&self, tasks: &[Task]) -> Result<u64> {
        if tasks.is_empty() {
            return Ok(0);
        }

        let tenant_id = tasks[0].tenant_id;
        if tasks.iter().any(|t| t.tenant_id != tenant_id) {
            return Err(MeshError::validation(
                "bulk insert batches must belong to one tenant",
            ));
        }

        let mut buffer = String::with_capacity(tasks.len() * 256);
        for task in tasks {
            buffer.push_str(&copy_row(task));
            buffer.push('\n');
        }

        let db = self.base.db().clone();
        let copied = self
            .base
            .execute_query("task_bulk_create", "task", || async move {
                let mut copy = db
                    .writer()
                    .copy_in_raw(&format!(
                        "COPY tasks ({COPY_COLUMNS}) FROM STDIN WITH (FORMAT csv)"
                    ))
                    .await?;
                copy.send(buffer.as_bytes()).await?;
                copy.finish().await
            })
            .await?;

        self.base.cache_delete(&[Self::list_key(tenant_id)]).await;
        info!(count = copied, tenant_id = %tenant_id, "Tasks bulk-inserted");
        Ok(copied)
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Task> {
        let key = Self::entity_key(tenant_id, id);
        match self.base.cache_get::<Task>(&key).await {
            Ok(cached) => return Ok(cached),
            Err(err) if err.kind == ErrorKind::CacheMiss => {}
            Err(err) => debug!(error = %err, "Cache read failed, falling through"),
        }

        let sql = self.base.statement("task_get", || {
            format!(
                "SELECT {COLUMNS} FROM tasks \
                 WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL"
            )
        });

        let db = self.base.db().clone();
        let found = self
            .base
            .execute_query("task_get", "task", || {
                sqlx::query_as::<_, Task>(&sql)
                    .bind(id)
                    .bind(tenant_id)
                    .fetch_optional(db.reader())
            })
            .await?
            .ok_or_else(|| MeshError::not_found("task", id))?;

        self.base.cache_set(&key, &found).await;
        Ok(found)
    }

    /// Version-gated field update (not status; see
    /// [`TaskRepository::transition_status`]).
    pub async fn update(&self, task: &Task) -> Result<Task> {
        let sql = self.base.statement("task_update", || {
            format!(
                "UPDATE tasks SET title = $4, description = $5, priority = $6, \
                 assignee = $7, payload = $8, tags = $9, version = version + 1, \
                 updated_at = NOW() \
                 WHERE id = $1 AND tenant_id = $2 AND version = $3 AND deleted_at IS NULL \
                 RETURNING {COLUMNS}"
            )
        });

        let db = self.base.db().clone();
        let updated = self
            .base
            .execute_query("task_update", "task", || {
                sqlx::query_as::<_, Task>(&sql)
                    .bind(task.id)
                    .bind(task.tenant_id)
                    .bind(task.version)
                    .bind(&task.title)
                    .bind(&task.description)
                    .bind(task.priority)
                    .bind(&task.assignee)
                    .bind(&task.payload)
                    .bind(&task.tags)
                    .fetch_optional(db.writer())
            })
            .await?;

        let updated = match updated {
            Some(row) => row,
            None => return Err(self.classify_update_miss(task.tenant_id, task.id).await),
        };

        self.base
            .cache_delete(&Self::invalidation_keys(task.tenant_id, task.id))
            .await;
        self.base
            .cache_set(&Self::entity_key(updated.tenant_id, updated.id), &updated)
            .await;

        Ok(updated)
    }

    async fn classify_update_miss(&self, tenant_id: Uuid, id: Uuid) -> MeshError {
        let db = self.base.db().clone();
        let exists = self
            .base
            .execute_query("task_exists", "task", || {
                sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM tasks \
                     WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL)",
                )
                .bind(id)
                .bind(tenant_id)
                .fetch_one(db.writer())
            })
            .await;

        match exists {
            Ok(true) => MeshError::optimistic_lock("task", id),
            Ok(false) => MeshError::not_found("task", id),
            Err(err) => err,
        }
    }

    pub async fn soft_delete(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let db = self.base.db().clone();
        let rows = self
            .base
            .execute_query("task_soft_delete", "task", || {
                sqlx::query(
                    "UPDATE tasks SET deleted_at = NOW(), version = version + 1, \
                     updated_at = NOW() \
                     WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
                )
                .bind(id)
                .bind(tenant_id)
                .execute(db.writer())
            })
            .await?;

        if rows.rows_affected() == 0 {
            return Err(MeshError::not_found("task", id));
        }

        self.base
            .cache_delete(&Self::invalidation_keys(tenant_id, id))
            .await;
        Ok(())
    }

    pub async fn list(&self, tenant_id: Uuid, opts: &ListOptions) -> Result<Vec<Task>> {
        let sort = sort_field(opts.sort_by.as_deref());
        let direction = if opts.descending { "DESC" } else { "ASC" };

        let db = self.base.db().clone();
        match opts.cursor {
            Some((cursor_at, cursor_id)) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM tasks \
                     WHERE tenant_id = $1 AND deleted_at IS NULL \
                     AND (created_at, id) > ($2, $3) \
                     ORDER BY created_at ASC, id ASC LIMIT $4"
                );
                self.base
                    .execute_query("task_list", "task", || {
                        sqlx::query_as::<_, Task>(&sql)
                            .bind(tenant_id)
                            .bind(cursor_at)
                            .bind(cursor_id)
                            .bind(opts.limit)
                            .fetch_all(db.reader())
                    })
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM tasks \
                     WHERE tenant_id = $1 AND deleted_at IS NULL \
                     ORDER BY {sort} {direction} LIMIT $2 OFFSET $3"
                );
                self.base
                    .execute_query("task_list", "task", || {
                        sqlx::query_as::<_, Task>(&sql)
                            .bind(tenant_id)
                            .bind(opts.limit)
                            .bind(opts.offset.unwrap_or(0))
                            .fetch_all(db.reader())
                    })
                    .await
            }
        }
    }

    /// Tasks currently assigned to a user within a tenant.
    pub async fn get_by_assignee(
        &self,
        tenant_id: Uuid,
        assignee: &str,
        opts: &ListOptions,
    ) -> Result<Vec<Task>> {
        let sql = self.base.statement("task_by_assignee", || {
            format!(
                "SELECT {COLUMNS} FROM tasks \
                 WHERE tenant_id = $1 AND assignee = $2 AND deleted_at IS NULL \
                 ORDER BY priority DESC, created_at ASC LIMIT $3 OFFSET $4"
            )
        });

        let db = self.base.db().clone();
        self.base
            .execute_query("task_by_assignee", "task", || {
                sqlx::query_as::<_, Task>(&sql)
                    .bind(tenant_id)
                    .bind(assignee)
                    .bind(opts.limit)
                    .bind(opts.offset.unwrap_or(0))
                    .fetch_all(db.reader())
            })
            .await
    }

    /// Title/tag search within a tenant.
    pub async fn search(
        &self,
        tenant_id: Uuid,
        query: &str,
        opts: &ListOptions,
    ) -> Result<Vec<Task>> {
        let sort = sort_field(opts.sort_by.as_deref());
        let direction = if opts.descending { "DESC" } else { "ASC" };
        let pattern = format!("%{}%", query);

        let sql = format!(
            "SELECT {COLUMNS} FROM tasks \
             WHERE tenant_id = $1 AND deleted_at IS NULL \
             AND (title ILIKE $2 OR $3 = ANY(tags)) \
             ORDER BY {sort} {direction} LIMIT $4 OFFSET $5"
        );

        let db = self.base.db().clone();
        self.base
            .execute_query("task_search", "task", || {
                sqlx::query_as::<_, Task>(&sql)
                    .bind(tenant_id)
                    .bind(&pattern)
                    .bind(query)
                    .bind(opts.limit)
                    .bind(opts.offset.unwrap_or(0))
                    .fetch_all(db.reader())
            })
            .await
    }

    // ============================================
    // STATUS TRANSITIONS
    // ============================================

    /// Moves a task through the state machine. Illegal transitions fail
    /// with `VALIDATION`; the update itself is version-gated. Terminal
    /// transitions stamp `completed_at`; entering `in_progress` stamps
    /// `started_at`. Every transition appends a task event.
    pub async fn transition_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        expected_version: i64,
        next: TaskStatus,
    ) -> Result<Task> {
        let current = self.get(tenant_id, id).await?;
        let current_status = current
            .task_status()
            .ok_or_else(|| MeshError::internal(format!("task {} has unknown status", id)))?;

        if !current_status.can_transition_to(next) {
            return Err(MeshError::validation(format!(
                "illegal task transition {} -> {}",
                current_status.as_str(),
                next.as_str()
            ))
            .with_resource("task")
            .with_context("id", id));
        }

        let updated = self
            .base
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let updated = sqlx::query_as::<_, Task>(&format!(
                        "UPDATE tasks SET status = $4, \
                         started_at = CASE WHEN $4 = 'in_progress' THEN NOW() ELSE started_at END, \
                         completed_at = CASE WHEN $4 IN ('completed', 'failed', 'cancelled', 'timeout') \
                                        THEN NOW() ELSE completed_at END, \
                         version = version + 1, updated_at = NOW() \
                         WHERE id = $1 AND tenant_id = $2 AND version = $3 AND deleted_at IS NULL \
                         RETURNING {COLUMNS}"
                    ))
                    .bind(id)
                    .bind(tenant_id)
                    .bind(expected_version)
                    .bind(next.as_str())
                    .fetch_optional(tx.conn()?)
                    .await?
                    .ok_or_else(|| MeshError::optimistic_lock("task", id))?;

                    sqlx::query(
                        "INSERT INTO task_events \
                         (id, tenant_id, task_id, event, detail, created_at) \
                         VALUES ($1, $2, $3, 'status_changed', $4, NOW())",
                    )
                    .bind(Uuid::new_v4())
                    .bind(tenant_id)
                    .bind(id)
                    .bind(serde_json::json!({ "to": next.as_str() }))
                    .execute(tx.conn()?)
                    .await?;

                    Ok(updated)
                })
            })
            .await?;

        self.base
            .cache_delete(&Self::invalidation_keys(tenant_id, id))
            .await;
        self.base
            .cache_set(&Self::entity_key(tenant_id, id), &updated)
            .await;

        Ok(updated)
    }

    // ============================================
    // DELEGATION
    // ============================================

    /// Reassigns a task, recording the delegation.
    pub async fn delegate(
        &self,
        tenant_id: Uuid,
        task_id: Uuid,
        from: Option<&str>,
        to: &str,
        reason: Option<&str>,
    ) -> Result<Task> {
        let from = from.map(String::from);
        let to_owned = to.to_string();
        let reason = reason.map(String::from);

        let updated = self
            .base
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let updated = sqlx::query_as::<_, Task>(&format!(
                        "UPDATE tasks SET assignee = $3, version = version + 1, updated_at = NOW() \
                         WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL \
                         RETURNING {COLUMNS}"
                    ))
                    .bind(task_id)
                    .bind(tenant_id)
                    .bind(&to_owned)
                    .fetch_optional(tx.conn()?)
                    .await?
                    .ok_or_else(|| MeshError::not_found("task", task_id))?;

                    sqlx::query(
                        "INSERT INTO task_delegations \
                         (id, tenant_id, task_id, delegated_from, delegated_to, reason, created_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, NOW())",
                    )
                    .bind(Uuid::new_v4())
                    .bind(tenant_id)
                    .bind(task_id)
                    .bind(&from)
                    .bind(&to_owned)
                    .bind(&reason)
                    .execute(tx.conn()?)
                    .await?;

                    Ok(updated)
                })
            })
            .await?;

        self.base
            .cache_delete(&Self::invalidation_keys(tenant_id, task_id))
            .await;
        Ok(updated)
    }

    // ============================================
    // EXECUTION CLAIMS
    // ============================================

    /// Tries to claim a task for execution with a session-scoped advisory
    /// lock. Returns false when another executor holds the claim.
    pub async fn try_claim(&self, id: Uuid) -> Result<bool> {
        let db = self.base.db().clone();
        self.base
            .execute_query("task_claim", "task", || {
                sqlx::query_scalar::<_, bool>(
                    "SELECT pg_try_advisory_lock(hashtextextended($1::text, 0))",
                )
                .bind(id)
                .fetch_one(db.writer())
            })
            .await
    }

    /// Releases an execution claim.
    pub async fn release_claim(&self, id: Uuid) -> Result<bool> {
        let db = self.base.db().clone();
        self.base
            .execute_query("task_release", "task", || {
                sqlx::query_scalar::<_, bool>(
                    "SELECT pg_advisory_unlock(hashtextextended($1::text, 0))",
                )
                .bind(id)
                .fetch_one(db.writer())
            })
            .await
    }

    // ============================================
    // STREAMING
    // ============================================

    /// Streams the tenant's tasks as pages over a channel, paging by the
    /// `(created_at, id)` cursor. The consumer side applies backpressure:
    /// the next page loads only once the previous send completed.
    pub fn stream_pages(
        self: &Arc<Self>,
        tenant_id: Uuid,
        page_size: i64,
    ) -> ReceiverStream<Result<Vec<Task>>> {
        let (tx, rx) = mpsc::channel(2);
        let repo = self.clone();

        tokio::spawn(async move {
            let mut cursor: Option<(DateTime<Utc>, Uuid)> = None;

            loop {
                let opts = ListOptions {
                    limit: page_size,
                    cursor,
                    ..Default::default()
                };

                let page = match repo.list(tenant_id, &opts).await {
                    Ok(page) => page,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };

                if page.is_empty() {
                    return;
                }

                cursor = page.last().map(|t| (t.created_at, t.id));
                let full = page.len() as i64 == page_size;

                if tx.send(Ok(page)).await.is_err() {
                    debug!("Task stream consumer dropped");
                    return;
                }
                if !full {
                    return;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    // ============================================
    // ARCHIVAL & INTEGRITY
    // ============================================

    /// Copies terminal tasks older than `before` into the archive table
    /// (best-effort), then deletes them. Returns the deleted count.
    pub async fn archive_terminal(&self, tenant_id: Uuid, before: DateTime<Utc>) -> Result<u64> {
        self.base
            .with_transaction(move |tx| {
                Box::pin(async move {
                    tx.savepoint("before_archive_copy").await?;

                    let copied = sqlx::query(
                        "INSERT INTO tasks_archive \
                         SELECT * FROM tasks \
                         WHERE tenant_id = $1 AND completed_at < $2 \
                         AND status IN ('completed', 'failed', 'cancelled', 'timeout')",
                    )
                    .bind(tenant_id)
                    .bind(before)
                    .execute(tx.conn()?)
                    .await;

                    if let Err(err) = copied {
                        warn!(error = %err, "Task archive table unavailable, deleting without copy");
                        tx.rollback_to_savepoint("before_archive_copy").await?;
                    }

                    let deleted = sqlx::query(
                        "DELETE FROM tasks \
                         WHERE tenant_id = $1 AND completed_at < $2 \
                         AND status IN ('completed', 'failed', 'cancelled', 'timeout')",
                    )
                    .bind(tenant_id)
                    .bind(before)
                    .execute(tx.conn()?)
                    .await?;

                    Ok(deleted.rows_affected())
                })
            })
            .await
    }

    /// Surfaces orphaned workflow references and status/timestamp
    /// contradictions.
    pub async fn validate_integrity(&self, tenant_id: Uuid) -> Result<TaskIntegrityReport> {
        let db = self.base.db().clone();
        let orphaned = self
            .base
            .execute_query("task_integrity_orphans", "task", || {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM tasks t \
                     LEFT JOIN workflows w ON w.id = t.workflow_id \
                     WHERE t.tenant_id = $1 AND t.deleted_at IS NULL \
                     AND t.workflow_id IS NOT NULL AND w.id IS NULL",
                )
                .bind(tenant_id)
                .fetch_one(db.reader())
            })
            .await?;

        let db = self.base.db().clone();
        let terminal_without_timestamp = self
            .base
            .execute_query("task_integrity_terminal", "task", || {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM tasks \
                     WHERE tenant_id = $1 AND deleted_at IS NULL \
                     AND status IN ('completed', 'failed', 'cancelled', 'timeout') \
                     AND completed_at IS NULL",
                )
                .bind(tenant_id)
                .fetch_one(db.reader())
            })
            .await?;

        let db = self.base.db().clone();
        let pending_with_start = self
            .base
            .execute_query("task_integrity_pending", "task", || {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM tasks \
                     WHERE tenant_id = $1 AND deleted_at IS NULL \
                     AND status = 'pending' AND started_at IS NOT NULL",
                )
                .bind(tenant_id)
                .fetch_one(db.reader())
            })
            .await?;

        Ok(TaskIntegrityReport {
            orphaned_workflow_refs: orphaned,
            terminal_without_timestamp,
            pending_with_start,
        })
    }
}

fn sort_field(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|field| SORT_FIELDS.iter().find(|allowed| **allowed == field))
        .copied()
        .unwrap_or(DEFAULT_SORT)
}

/// One CSV line for the COPY stream, in `COPY_COLUMNS` order.
fn copy_row(task: &Task) -> String {
    let fields = [
        csv_field(&task.id.to_string()),
        csv_field(&task.tenant_id.to_string()),
        csv_field(&task.title),
        task.description.as_deref().map(csv_field).unwrap_or_default(),
        csv_field(&task.status),
        task.priority.to_string(),
        task.assignee.as_deref().map(csv_field).unwrap_or_default(),
        csv_field(&task.payload.to_string()),
        csv_field(&tags_literal(&task.tags)),
        task.workflow_id
            .map(|id| csv_field(&id.to_string()))
            .unwrap_or_default(),
        "1".to_string(),
        csv_field(&task.created_at.to_rfc3339()),
        csv_field(&task.updated_at.to_rfc3339()),
    ];
    fields.join(",")
}

/// Quotes a CSV field, doubling embedded quotes. Unquoted empty fields are
/// NULL to COPY, which is why absent options emit nothing.
fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Postgres array literal for the tags column.
fn tags_literal(tags: &[String]) -> String {
    let escaped: Vec<String> = tags
        .iter()
        .map(|t| format!("\"{}\"", t.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", escaped.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_field_allowlist() {
        assert_eq!(sort_field(Some("priority")), "priority");
        assert_eq!(sort_field(Some("payload")), "created_at");
        assert_eq!(sort_field(None), "created_at");
    }

    #[test]
    fn test_csv_field_escaping() {
        assert_eq!(csv_field("plain"), "\"plain\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
    }

    #[test]
    fn test_tags_literal() {
        assert_eq!(tags_literal(&[]), "{}");
        assert_eq!(
            tags_literal(&["alpha".to_string(), "beta".to_string()]),
            "{\"alpha\",\"beta\"}"
        );
    }

    #[test]
    fn test_copy_row_field_count() {
        let task = Task::new(Uuid::new_v4(), "bulk me");
        let row = copy_row(&task);

        // CSV-aware split: commas inside quotes do not separate fields.
        let mut fields = 0;
        let mut in_quotes = false;
        for c in row.chars() {
            match c {
                '"' => in_quotes = !in_quotes,
                ',' if !in_quotes => fields += 1,
                _ => {}
            }
        }
        assert_eq!(fields + 1, COPY_COLUMNS.split(',').count());
    }

    #[test]
    fn test_copy_row_nulls_for_absent_options() {
        let task = Task::new(Uuid::new_v4(), "no description");
        let row = copy_row(&task);
        // description and assignee are empty (NULL) fields.
        assert!(row.contains(",,"));
    }
}
