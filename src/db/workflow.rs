//! Workflow repository
//!
//! Workflows and their nested executions. Execution state is a JSON blob;
//! step status updates mutate a sub-key of that blob inside a transaction.
//! State patches merge last-write-wins by default, recursively when the
//! repository is configured for deep merge.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorKind, MeshError, Result};

use super::base::BaseRepository;
use super::entities::{ExecutionStatus, Workflow, WorkflowExecution};
use super::ListOptions;

const COLUMNS: &str = "id, tenant_id, name, description, status, definition, tags, version, \
                       created_at, updated_at, deleted_at";

const EXECUTION_COLUMNS: &str = "id, tenant_id, workflow_id, status, state, started_at, \
                                 completed_at, version, created_at, updated_at, deleted_at";

/// Sort columns allowed on list/search; anything else falls back silently.
const SORT_FIELDS: &[&str] = &["created_at", "updated_at", "name", "status"];
const DEFAULT_SORT: &str = "created_at";

/// Counts from an integrity sweep.
#[derive(Debug, Clone, Default)]
pub struct WorkflowIntegrityReport {
    /// Executions whose workflow row is gone.
    pub orphaned_executions: i64,
    /// Executions marked completed without a completion timestamp.
    pub completed_without_timestamp: i64,
    /// Executions still pending but carrying a completion timestamp.
    pub pending_with_timestamp: i64,
}

/// Repository for workflows and workflow executions.
pub struct WorkflowRepository {
    base: Arc<BaseRepository>,
    /// Recursive object merge for state patches instead of last-write-wins.
    deep_merge: bool,
}

impl WorkflowRepository {
    pub fn new(base: Arc<BaseRepository>) -> Self {
        Self {
            base,
            deep_merge: false,
        }
    }

    pub fn with_deep_merge(mut self, deep_merge: bool) -> Self {
        self.deep_merge = deep_merge;
        self
    }

    fn entity_key(tenant_id: Uuid, id: Uuid) -> String {
        format!("workflow:{}:{}", tenant_id, id)
    }

    fn list_key(tenant_id: Uuid) -> String {
        format!("workflow:list:{}", tenant_id)
    }

    fn execution_key(tenant_id: Uuid, id: Uuid) -> String {
        format!("workflow_execution:{}:{}", tenant_id, id)
    }

    /// Keys invalidated by any write on a workflow aggregate.
    fn invalidation_keys(tenant_id: Uuid, id: Uuid) -> Vec<String> {
        vec![
            Self::entity_key(tenant_id, id),
            Self::list_key(tenant_id),
            format!("workflow:executions:{}", id),
        ]
    }

    // ============================================
    // WORKFLOW CRUD
    // ============================================

    pub async fn create(&self, workflow: &Workflow) -> Result<Workflow> {
        let sql = self.base.statement("workflow_insert", || {
            format!(
                "INSERT INTO workflows ({COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 1, NOW(), NOW(), NULL) \
                 RETURNING {COLUMNS}"
            )
        });

        let db = self.base.db().clone();
        let created = self
            .base
            .execute_query("workflow_create", "workflow", || {
                sqlx::query_as::<_, Workflow>(&sql)
                    .bind(workflow.id)
                    .bind(workflow.tenant_id)
                    .bind(&workflow.name)
                    .bind(&workflow.description)
                    .bind(&workflow.status)
                    .bind(&workflow.definition)
                    .bind(&workflow.tags)
                    .fetch_one(db.writer())
            })
            .await?;

        self.base
            .cache_delete(&[Self::list_key(workflow.tenant_id)])
            .await;
        self.base
            .cache_set(&Self::entity_key(created.tenant_id, created.id), &created)
            .await;

        info!(workflow_id = %created.id, tenant_id = %created.tenant_id, "Workflow created");
        Ok(created)
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Workflow> {
        let key = Self::entity_key(tenant_id, id);
        match self.base.cache_get::<Workflow>(&key).await {
            Ok(cached) => return Ok(cached),
            Err(err) if err.kind == ErrorKind::CacheMiss => {}
            Err(err) => debug!(error = %err, "Cache read failed, falling through"),
        }

        let sql = self.base.statement("workflow_get", || {
            format!(
                "SELECT {COLUMNS} FROM workflows \
                 WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL"
            )
        });

        let db = self.base.db().clone();
        let found = self
            .base
            .execute_query("workflow_get", "workflow", || {
                sqlx::query_as::<_, Workflow>(&sql)
                    .bind(id)
                    .bind(tenant_id)
                    .fetch_optional(db.reader())
            })
            .await?
            .ok_or_else(|| MeshError::not_found("workflow", id))?;

        self.base.cache_set(&key, &found).await;
        Ok(found)
    }

    pub async fn get_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Workflow> {
        let sql = self.base.statement("workflow_get_by_name", || {
            format!(
                "SELECT {COLUMNS} FROM workflows \
                 WHERE tenant_id = $1 AND name = $2 AND deleted_at IS NULL \
                 ORDER BY created_at DESC LIMIT 1"
            )
        });

        let db = self.base.db().clone();
        self.base
            .execute_query("workflow_get_by_name", "workflow", || {
                sqlx::query_as::<_, Workflow>(&sql)
                    .bind(tenant_id)
                    .bind(name)
                    .fetch_optional(db.reader())
            })
            .await?
            .ok_or_else(|| MeshError::not_found("workflow", name))
    }

    /// Version-gated update. Exactly one of two concurrent updates at the
    /// same prior version wins; the loser sees `OPTIMISTIC_LOCK`.
    pub async fn update(&self, workflow: &Workflow) -> Result<Workflow> {
        let sql = self.base.statement("workflow_update", || {
            format!(
                "UPDATE workflows SET name = $4, description = $5, status = $6, \
                 definition = $7, tags = $8, version = version + 1, updated_at = NOW() \
                 WHERE id = $1 AND tenant_id = $2 AND version = $3 AND deleted_at IS NULL \
                 RETURNING {COLUMNS}"
            )
        });

        let db = self.base.db().clone();
        let updated = self
            .base
            .execute_query("workflow_update", "workflow", || {
                sqlx::query_as::<_, Workflow>(&sql)
                    .bind(workflow.id)
                    .bind(workflow.tenant_id)
                    .bind(workflow.version)
                    .bind(&workflow.name)
                    .bind(&workflow.description)
                    .bind(&workflow.status)
                    .bind(&workflow.definition)
                    .bind(&workflow.tags)
                    .fetch_optional(db.writer())
            })
            .await?;

        let updated = match updated {
            Some(row) => row,
            None => {
                return Err(self
                    .classify_update_miss(workflow.tenant_id, workflow.id)
                    .await)
            }
        };

        self.base
            .cache_delete(&Self::invalidation_keys(workflow.tenant_id, workflow.id))
            .await;
        self.base
            .cache_set(&Self::entity_key(updated.tenant_id, updated.id), &updated)
            .await;

        Ok(updated)
    }

    /// Zero rows on a conditional update means either the row is gone or
    /// the version moved; an existence probe tells the two apart.
    async fn classify_update_miss(&self, tenant_id: Uuid, id: Uuid) -> MeshError {
        let db = self.base.db().clone();
        let exists = self
            .base
            .execute_query("workflow_exists", "workflow", || {
                sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM workflows \
                     WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL)",
                )
                .bind(id)
                .bind(tenant_id)
                .fetch_one(db.writer())
            })
            .await;

        match exists {
            Ok(true) => MeshError::optimistic_lock("workflow", id),
            Ok(false) => MeshError::not_found("workflow", id),
            Err(err) => err,
        }
    }

    /// Soft delete; the row disappears from non-administrative reads.
    pub async fn soft_delete(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let db = self.base.db().clone();
        let rows = self
            .base
            .execute_query("workflow_soft_delete", "workflow", || {
                sqlx::query(
                    "UPDATE workflows SET deleted_at = NOW(), version = version + 1, \
                     updated_at = NOW() \
                     WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
                )
                .bind(id)
                .bind(tenant_id)
                .execute(db.writer())
            })
            .await?;

        if rows.rows_affected() == 0 {
            return Err(MeshError::not_found("workflow", id));
        }

        self.base
            .cache_delete(&Self::invalidation_keys(tenant_id, id))
            .await;
        info!(workflow_id = %id, "Workflow soft-deleted");
        Ok(())
    }

    /// Tenant-scoped listing with allow-listed sorting and either offset
    /// or `(created_at, id)` cursor pagination.
    pub async fn list(&self, tenant_id: Uuid, opts: &ListOptions) -> Result<Vec<Workflow>> {
        let sort = sort_field(opts.sort_by.as_deref());
        let direction = if opts.descending { "DESC" } else { "ASC" };

        let db = self.base.db().clone();
        let rows = match opts.cursor {
            Some((cursor_at, cursor_id)) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM workflows \
                     WHERE tenant_id = $1 AND deleted_at IS NULL \
                     AND (created_at, id) > ($2, $3) \
                     ORDER BY created_at ASC, id ASC LIMIT $4"
                );
                self.base
                    .execute_query("workflow_list", "workflow", || {
                        sqlx::query_as::<_, Workflow>(&sql)
                            .bind(tenant_id)
                            .bind(cursor_at)
                            .bind(cursor_id)
                            .bind(opts.limit)
                            .fetch_all(db.reader())
                    })
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM workflows \
                     WHERE tenant_id = $1 AND deleted_at IS NULL \
                     ORDER BY {sort} {direction} LIMIT $2 OFFSET $3"
                );
                self.base
                    .execute_query("workflow_list", "workflow", || {
                        sqlx::query_as::<_, Workflow>(&sql)
                            .bind(tenant_id)
                            .bind(opts.limit)
                            .bind(opts.offset.unwrap_or(0))
                            .fetch_all(db.reader())
                    })
                    .await?
            }
        };

        Ok(rows)
    }

    /// Name/tag search within a tenant.
    pub async fn search(
        &self,
        tenant_id: Uuid,
        query: &str,
        opts: &ListOptions,
    ) -> Result<Vec<Workflow>> {
        let sort = sort_field(opts.sort_by.as_deref());
        let direction = if opts.descending { "DESC" } else { "ASC" };
        let pattern = format!("%{}%", query);

        let sql = format!(
            "SELECT {COLUMNS} FROM workflows \
             WHERE tenant_id = $1 AND deleted_at IS NULL \
             AND (name ILIKE $2 OR $3 = ANY(tags)) \
             ORDER BY {sort} {direction} LIMIT $4 OFFSET $5"
        );

        let db = self.base.db().clone();
        self.base
            .execute_query("workflow_search", "workflow", || {
                sqlx::query_as::<_, Workflow>(&sql)
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
    // EXECUTIONS
    // ============================================

    pub async fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecution> {
        let sql = self.base.statement("execution_insert", || {
            format!(
                "INSERT INTO workflow_executions ({EXECUTION_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 1, NOW(), NOW(), NULL) \
                 RETURNING {EXECUTION_COLUMNS}"
            )
        });

        let db = self.base.db().clone();
        let created = self
            .base
            .execute_query("execution_create", "workflow_execution", || {
                sqlx::query_as::<_, WorkflowExecution>(&sql)
                    .bind(execution.id)
                    .bind(execution.tenant_id)
                    .bind(execution.workflow_id)
                    .bind(&execution.status)
                    .bind(&execution.state)
                    .bind(execution.started_at)
                    .bind(execution.completed_at)
                    .fetch_one(db.writer())
            })
            .await?;

        self.base
            .cache_delete(&[format!("workflow:executions:{}", execution.workflow_id)])
            .await;

        Ok(created)
    }

    pub async fn get_execution(&self, tenant_id: Uuid, id: Uuid) -> Result<WorkflowExecution> {
        let key = Self::execution_key(tenant_id, id);
        match self.base.cache_get::<WorkflowExecution>(&key).await {
            Ok(cached) => return Ok(cached),
            Err(err) if err.kind == ErrorKind::CacheMiss => {}
            Err(err) => debug!(error = %err, "Cache read failed, falling through"),
        }

        let sql = self.base.statement("execution_get", || {
            format!(
                "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
                 WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL"
            )
        });

        let db = self.base.db().clone();
        let found = self
            .base
            .execute_query("execution_get", "workflow_execution", || {
                sqlx::query_as::<_, WorkflowExecution>(&sql)
                    .bind(id)
                    .bind(tenant_id)
                    .fetch_optional(db.reader())
            })
            .await?
            .ok_or_else(|| MeshError::not_found("workflow_execution", id))?;

        self.base.cache_set(&key, &found).await;
        Ok(found)
    }

    pub async fn list_executions(
        &self,
        tenant_id: Uuid,
        workflow_id: Uuid,
        opts: &ListOptions,
    ) -> Result<Vec<WorkflowExecution>> {
        let sql = self.base.statement("execution_list", || {
            format!(
                "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
                 WHERE tenant_id = $1 AND workflow_id = $2 AND deleted_at IS NULL \
                 ORDER BY created_at DESC LIMIT $3 OFFSET $4"
            )
        });

        let db = self.base.db().clone();
        self.base
            .execute_query("execution_list", "workflow_execution", || {
                sqlx::query_as::<_, WorkflowExecution>(&sql)
                    .bind(tenant_id)
                    .bind(workflow_id)
                    .bind(opts.limit)
                    .bind(opts.offset.unwrap_or(0))
                    .fetch_all(db.reader())
            })
            .await
    }

    /// Applies a state patch inside a transaction, recording the prior
    /// state in the history table. Merge semantics follow the repository's
    /// merge mode.
    pub async fn update_execution_state(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
        patch: Value,
    ) -> Result<WorkflowExecution> {
        let deep = self.deep_merge;
        let updated = self
            .base
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let current = sqlx::query_as::<_, WorkflowExecution>(&format!(
                        "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
                         WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL FOR UPDATE"
                    ))
                    .bind(execution_id)
                    .bind(tenant_id)
                    .fetch_optional(tx.conn()?)
                    .await?
                    .ok_or_else(|| MeshError::not_found("workflow_execution", execution_id))?;

                    let merged = merge_state(&current.state, &patch, deep);

                    sqlx::query(
                        "INSERT INTO workflow_state_history \
                         (id, tenant_id, execution_id, state, version, created_at) \
                         VALUES ($1, $2, $3, $4, $5, NOW())",
                    )
                    .bind(Uuid::new_v4())
                    .bind(tenant_id)
                    .bind(execution_id)
                    .bind(&current.state)
                    .bind(current.version)
                    .execute(tx.conn()?)
                    .await?;

                    let updated = sqlx::query_as::<_, WorkflowExecution>(&format!(
                        "UPDATE workflow_executions \
                         SET state = $3, version = version + 1, updated_at = NOW() \
                         WHERE id = $1 AND tenant_id = $2 \
                         RETURNING {EXECUTION_COLUMNS}"
                    ))
                    .bind(execution_id)
                    .bind(tenant_id)
                    .bind(&merged)
                    .fetch_one(tx.conn()?)
                    .await?;

                    Ok(updated)
                })
            })
            .await?;

        self.base
            .cache_delete(&[
                Self::execution_key(tenant_id, execution_id),
                format!("workflow:executions:{}", updated.workflow_id),
            ])
            .await;

        Ok(updated)
    }

    /// Sets one step's status inside the state blob, transactionally.
    pub async fn update_step_status(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
        status: ExecutionStatus,
    ) -> Result<WorkflowExecution> {
        let patch = serde_json::json!({
            "steps": {
                step_id: {
                    "status": status.as_str(),
                    "updated_at": Utc::now().to_rfc3339(),
                }
            }
        });

        // Step patches always merge recursively; replacing the whole
        // `steps` map would drop sibling steps.
        let step_repo = Self {
            base: self.base.clone(),
            deep_merge: true,
        };
        step_repo
            .update_execution_state(tenant_id, execution_id, patch)
            .await
    }

    // ============================================
    // ARCHIVAL & INTEGRITY
    // ============================================

    /// Copies finished executions older than `before` into the archive
    /// table, then deletes them. The copy is best-effort: a missing
    /// archive table rolls back to a savepoint and the delete proceeds.
    pub async fn archive_executions(
        &self,
        tenant_id: Uuid,
        before: DateTime<Utc>,
    ) -> Result<u64> {
        self.base
            .with_transaction(move |tx| {
                Box::pin(async move {
                    tx.savepoint("before_archive_copy").await?;

                    let copied = sqlx::query(
                        "INSERT INTO workflow_executions_archive \
                         SELECT * FROM workflow_executions \
                         WHERE tenant_id = $1 AND completed_at < $2 \
                         AND status IN ('completed', 'failed', 'cancelled')",
                    )
                    .bind(tenant_id)
                    .bind(before)
                    .execute(tx.conn()?)
                    .await;

                    match copied {
                        Ok(result) => {
                            debug!(rows = result.rows_affected(), "Executions copied to archive");
                        }
                        Err(err) => {
                            debug!(error = %err, "Archive table unavailable, deleting without copy");
                            tx.rollback_to_savepoint("before_archive_copy").await?;
                        }
                    }

                    let deleted = sqlx::query(
                        "DELETE FROM workflow_executions \
                         WHERE tenant_id = $1 AND completed_at < $2 \
                         AND status IN ('completed', 'failed', 'cancelled')",
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

    /// Surfaces orphaned executions and status/timestamp contradictions.
    pub async fn validate_integrity(&self, tenant_id: Uuid) -> Result<WorkflowIntegrityReport> {
        let db = self.base.db().clone();

        let orphaned = self
            .base
            .execute_query("workflow_integrity_orphans", "workflow_execution", || {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM workflow_executions e \
                     LEFT JOIN workflows w ON w.id = e.workflow_id \
                     WHERE e.tenant_id = $1 AND e.deleted_at IS NULL AND w.id IS NULL",
                )
                .bind(tenant_id)
                .fetch_one(db.reader())
            })
            .await?;

        let db = self.base.db().clone();
        let completed_without_timestamp = self
            .base
            .execute_query("workflow_integrity_completed", "workflow_execution", || {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM workflow_executions \
                     WHERE tenant_id = $1 AND deleted_at IS NULL \
                     AND status = 'completed' AND completed_at IS NULL",
                )
                .bind(tenant_id)
                .fetch_one(db.reader())
            })
            .await?;

        let db = self.base.db().clone();
        let pending_with_timestamp = self
            .base
            .execute_query("workflow_integrity_pending", "workflow_execution", || {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM workflow_executions \
                     WHERE tenant_id = $1 AND deleted_at IS NULL \
                     AND status = 'pending' AND completed_at IS NOT NULL",
                )
                .bind(tenant_id)
                .fetch_one(db.reader())
            })
            .await?;

        Ok(WorkflowIntegrityReport {
            orphaned_executions: orphaned,
            completed_without_timestamp,
            pending_with_timestamp,
        })
    }
}

fn sort_field(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|field| SORT_FIELDS.iter().find(|allowed| **allowed == field))
        .copied()
        .unwrap_or(DEFAULT_SORT)
}

/// Merges a patch into the current state: recursive object merge when
/// `deep`, last-write-wins per top-level key otherwise.
fn merge_state(current: &Value, patch: &Value, deep: bool) -> Value {
    match (current, patch) {
        (Value::Object(current_map), Value::Object(patch_map)) => {
            let mut merged = current_map.clone();
            for (key, patch_value) in patch_map {
                if deep {
                    let merged_value = match merged.get(key) {
                        Some(existing) => merge_state(existing, patch_value, true),
                        None => patch_value.clone(),
                    };
                    merged.insert(key.clone(), merged_value);
                } else {
                    merged.insert(key.clone(), patch_value.clone());
                }
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sort_field_allowlist() {
        assert_eq!(sort_field(Some("name")), "name");
        assert_eq!(sort_field(Some("updated_at")), "updated_at");
        // Unknown fields fall back silently.
        assert_eq!(sort_field(Some("definition; DROP TABLE")), "created_at");
        assert_eq!(sort_field(None), "created_at");
    }

    #[test]
    fn test_merge_state_last_write_wins() {
        let current = json!({"steps": {"a": {"status": "running"}}, "counter": 1});
        let patch = json!({"steps": {"b": {"status": "pending"}}});

        let merged = merge_state(&current, &patch, false);
        // Top-level replacement: the steps map is overwritten wholesale.
        assert!(merged["steps"].get("a").is_none());
        assert_eq!(merged["steps"]["b"]["status"], "pending");
        assert_eq!(merged["counter"], 1);
    }

    #[test]
    fn test_merge_state_deep() {
        let current = json!({"steps": {"a": {"status": "running", "attempt": 2}}});
        let patch = json!({"steps": {"a": {"status": "completed"}, "b": {"status": "pending"}}});

        let merged = merge_state(&current, &patch, true);
        assert_eq!(merged["steps"]["a"]["status"], "completed");
        assert_eq!(merged["steps"]["a"]["attempt"], 2);
        assert_eq!(merged["steps"]["b"]["status"], "pending");
    }

    #[test]
    fn test_merge_state_non_object_patch_replaces() {
        let current = json!({"a": 1});
        let patch = json!([1, 2, 3]);
        assert_eq!(merge_state(&current, &patch, true), json!([1, 2, 3]));
    }

    #[test]
    fn test_invalidation_keys_cover_aggregate() {
        let tenant = Uuid::new_v4();
        let id = Uuid::new_v4();
        let keys = WorkflowRepository::invalidation_keys(tenant, id);

        assert!(keys.contains(&format!("workflow:{}:{}", tenant, id)));
        assert!(keys.contains(&format!("workflow:list:{}", tenant)));
        assert!(keys.contains(&format!("workflow:executions:{}", id)));
    }
}
