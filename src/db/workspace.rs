//! Workspace repository
//!
//! Workspaces, their member lists (upsert semantics), a time-bounded
//! exclusive lock on the workspace itself, and the activity feed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorKind, MeshError, Result};

use super::base::BaseRepository;
use super::entities::{Workspace, WorkspaceMember};
use super::ListOptions;

const COLUMNS: &str = "id, tenant_id, name, description, status, settings, tags, locked_by, \
                       lock_expires_at, version, created_at, updated_at, deleted_at";

const MEMBER_COLUMNS: &str = "workspace_id, user_id, role, joined_at, updated_at";

const SORT_FIELDS: &[&str] = &["created_at", "updated_at", "name", "status"];
const DEFAULT_SORT: &str = "created_at";

/// Repository for workspaces and their members.
pub struct WorkspaceRepository {
    base: Arc<BaseRepository>,
}

impl WorkspaceRepository {
    pub fn new(base: Arc<BaseRepository>) -> Self {
        Self { base }
    }

    fn entity_key(tenant_id: Uuid, id: Uuid) -> String {
        format!("workspace:{}:{}", tenant_id, id)
    }

    fn list_key(tenant_id: Uuid) -> String {
        format!("workspace:list:{}", tenant_id)
    }

    fn members_key(id: Uuid) -> String {
        format!("workspace:members:{}", id)
    }

    fn invalidation_keys(tenant_id: Uuid, id: Uuid) -> Vec<String> {
        vec![
            Self::entity_key(tenant_id, id),
            Self::list_key(tenant_id),
            Self::members_key(id),
        ]
    }

    // ============================================
    // WORKSPACE CRUD
    // ============================================

    pub async fn create(&self, workspace: &Workspace) -> Result<Workspace> {
        let sql = self.base.statement("workspace_insert", || {
            format!(
                "INSERT INTO workspaces ({COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, NULL, 1, NOW(), NOW(), NULL) \
                 RETURNING {COLUMNS}"
            )
        });

        let db = self.base.db().clone();
        let created = self
            .base
            .execute_query("workspace_create", "workspace", || {
                sqlx::query_as::<_, Workspace>(&sql)
                    .bind(workspace.id)
                    .bind(workspace.tenant_id)
                    .bind(&workspace.name)
                    .bind(&workspace.description)
                    .bind(&workspace.status)
                    .bind(&workspace.settings)
                    .bind(&workspace.tags)
                    .fetch_one(db.writer())
            })
            .await?;

        self.base
            .cache_delete(&[Self::list_key(workspace.tenant_id)])
            .await;
        self.base
            .cache_set(&Self::entity_key(created.tenant_id, created.id), &created)
            .await;

        info!(workspace_id = %created.id, "Workspace created");
        Ok(created)
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Workspace> {
        let key = Self::entity_key(tenant_id, id);
        match self.base.cache_get::<Workspace>(&key).await {
            Ok(cached) => return Ok(cached),
            Err(err) if err.kind == ErrorKind::CacheMiss => {}
            Err(err) => debug!(error = %err, "Cache read failed, falling through"),
        }

        let sql = self.base.statement("workspace_get", || {
            format!(
                "SELECT {COLUMNS} FROM workspaces \
                 WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL"
            )
        });

        let db = self.base.db().clone();
        let found = self
            .base
            .execute_query("workspace_get", "workspace", || {
                sqlx::query_as::<_, Workspace>(&sql)
                    .bind(id)
                    .bind(tenant_id)
                    .fetch_optional(db.reader())
            })
            .await?
            .ok_or_else(|| MeshError::not_found("workspace", id))?;

        self.base.cache_set(&key, &found).await;
        Ok(found)
    }

    /// Version-gated update; see the workflow repository for the
    /// NOT_FOUND vs OPTIMISTIC_LOCK distinction.
    pub async fn update(&self, workspace: &Workspace) -> Result<Workspace> {
        let sql = self.base.statement("workspace_update", || {
            format!(
                "UPDATE workspaces SET name = $4, description = $5, status = $6, \
                 settings = $7, tags = $8, version = version + 1, updated_at = NOW() \
                 WHERE id = $1 AND tenant_id = $2 AND version = $3 AND deleted_at IS NULL \
                 RETURNING {COLUMNS}"
            )
        });

        let db = self.base.db().clone();
        let updated = self
            .base
            .execute_query("workspace_update", "workspace", || {
                sqlx::query_as::<_, Workspace>(&sql)
                    .bind(workspace.id)
                    .bind(workspace.tenant_id)
                    .bind(workspace.version)
                    .bind(&workspace.name)
                    .bind(&workspace.description)
                    .bind(&workspace.status)
                    .bind(&workspace.settings)
                    .bind(&workspace.tags)
                    .fetch_optional(db.writer())
            })
            .await?;

        let updated = match updated {
            Some(row) => row,
            None => {
                let db = self.base.db().clone();
                let exists = self
                    .base
                    .execute_query("workspace_exists", "workspace", || {
                        sqlx::query_scalar::<_, bool>(
                            "SELECT EXISTS(SELECT 1 FROM workspaces \
                             WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL)",
                        )
                        .bind(workspace.id)
                        .bind(workspace.tenant_id)
                        .fetch_one(db.writer())
                    })
                    .await?;
                return Err(if exists {
                    MeshError::optimistic_lock("workspace", workspace.id)
                } else {
                    MeshError::not_found("workspace", workspace.id)
                });
            }
        };

        self.base
            .cache_delete(&Self::invalidation_keys(workspace.tenant_id, workspace.id))
            .await;
        self.base
            .cache_set(&Self::entity_key(updated.tenant_id, updated.id), &updated)
            .await;

        Ok(updated)
    }

    pub async fn soft_delete(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let db = self.base.db().clone();
        let rows = self
            .base
            .execute_query("workspace_soft_delete", "workspace", || {
                sqlx::query(
                    "UPDATE workspaces SET deleted_at = NOW(), version = version + 1, \
                     updated_at = NOW() \
                     WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
                )
                .bind(id)
                .bind(tenant_id)
                .execute(db.writer())
            })
            .await?;

        if rows.rows_affected() == 0 {
            return Err(MeshError::not_found("workspace", id));
        }

        self.base
            .cache_delete(&Self::invalidation_keys(tenant_id, id))
            .await;
        Ok(())
    }

    pub async fn list(&self, tenant_id: Uuid, opts: &ListOptions) -> Result<Vec<Workspace>> {
        let sort = sort_field(opts.sort_by.as_deref());
        let direction = if opts.descending { "DESC" } else { "ASC" };

        let sql = format!(
            "SELECT {COLUMNS} FROM workspaces \
             WHERE tenant_id = $1 AND deleted_at IS NULL \
             ORDER BY {sort} {direction} LIMIT $2 OFFSET $3"
        );

        let db = self.base.db().clone();
        self.base
            .execute_query("workspace_list", "workspace", || {
                sqlx::query_as::<_, Workspace>(&sql)
                    .bind(tenant_id)
                    .bind(opts.limit)
                    .bind(opts.offset.unwrap_or(0))
                    .fetch_all(db.reader())
            })
            .await
    }

    pub async fn get_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Workspace> {
        let sql = self.base.statement("workspace_get_by_name", || {
            format!(
                "SELECT {COLUMNS} FROM workspaces \
                 WHERE tenant_id = $1 AND name = $2 AND deleted_at IS NULL \
                 ORDER BY created_at DESC LIMIT 1"
            )
        });

        let db = self.base.db().clone();
        self.base
            .execute_query("workspace_get_by_name", "workspace", || {
                sqlx::query_as::<_, Workspace>(&sql)
                    .bind(tenant_id)
                    .bind(name)
                    .fetch_optional(db.reader())
            })
            .await?
            .ok_or_else(|| MeshError::not_found("workspace", name))
    }

    /// Name/tag search within a tenant.
    pub async fn search(
        &self,
        tenant_id: Uuid,
        query: &str,
        opts: &ListOptions,
    ) -> Result<Vec<Workspace>> {
        let sort = sort_field(opts.sort_by.as_deref());
        let direction = if opts.descending { "DESC" } else { "ASC" };
        let pattern = format!("%{}%", query);

        let sql = format!(
            "SELECT {COLUMNS} FROM workspaces \
             WHERE tenant_id = $1 AND deleted_at IS NULL \
             AND (name ILIKE $2 OR $3 = ANY(tags)) \
             ORDER BY {sort} {direction} LIMIT $4 OFFSET $5"
        );

        let db = self.base.db().clone();
        self.base
            .execute_query("workspace_search", "workspace", || {
                sqlx::query_as::<_, Workspace>(&sql)
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
    // MEMBERS
    // ============================================

    /// Adds or updates a member in one statement.
    pub async fn upsert_member(
        &self,
        workspace_id: Uuid,
        user_id: &str,
        role: &str,
    ) -> Result<WorkspaceMember> {
        let sql = self.base.statement("member_upsert", || {
            format!(
                "INSERT INTO workspace_members ({MEMBER_COLUMNS}) \
                 VALUES ($1, $2, $3, NOW(), NOW()) \
                 ON CONFLICT (workspace_id, user_id) DO UPDATE SET \
                 role = EXCLUDED.role, updated_at = NOW() \
                 RETURNING {MEMBER_COLUMNS}"
            )
        });

        let db = self.base.db().clone();
        let member = self
            .base
            .execute_query("member_upsert", "workspace_member", || {
                sqlx::query_as::<_, WorkspaceMember>(&sql)
                    .bind(workspace_id)
                    .bind(user_id)
                    .bind(role)
                    .fetch_one(db.writer())
            })
            .await?;

        self.base
            .cache_delete(&[Self::members_key(workspace_id)])
            .await;
        Ok(member)
    }

    pub async fn remove_member(&self, workspace_id: Uuid, user_id: &str) -> Result<()> {
        let db = self.base.db().clone();
        let rows = self
            .base
            .execute_query("member_remove", "workspace_member", || {
                sqlx::query(
                    "DELETE FROM workspace_members WHERE workspace_id = $1 AND user_id = $2",
                )
                .bind(workspace_id)
                .bind(user_id)
                .execute(db.writer())
            })
            .await?;

        if rows.rows_affected() == 0 {
            return Err(MeshError::not_found("workspace_member", user_id));
        }

        self.base
            .cache_delete(&[Self::members_key(workspace_id)])
            .await;
        Ok(())
    }

    pub async fn list_members(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>> {
        let key = Self::members_key(workspace_id);
        match self.base.cache_get::<Vec<WorkspaceMember>>(&key).await {
            Ok(cached) => return Ok(cached),
            Err(err) if err.kind == ErrorKind::CacheMiss => {}
            Err(err) => debug!(error = %err, "Cache read failed, falling through"),
        }

        let sql = self.base.statement("member_list", || {
            format!(
                "SELECT {MEMBER_COLUMNS} FROM workspace_members \
                 WHERE workspace_id = $1 ORDER BY joined_at ASC"
            )
        });

        let db = self.base.db().clone();
        let members = self
            .base
            .execute_query("member_list", "workspace_member", || {
                sqlx::query_as::<_, WorkspaceMember>(&sql)
                    .bind(workspace_id)
                    .fetch_all(db.reader())
            })
            .await?;

        self.base.cache_set(&key, &members).await;
        Ok(members)
    }

    // ============================================
    // EXCLUSIVE LOCK
    // ============================================

    /// Acquires (or re-enters) the workspace lock for `ttl`. Expired locks
    /// are reclaimable by any holder. Returns `CONFLICT` while another
    /// holder owns an unexpired lock.
    pub async fn acquire_lock(
        &self,
        tenant_id: Uuid,
        workspace_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|_| MeshError::validation("lock ttl out of range"))?;

        let db = self.base.db().clone();
        let rows = self
            .base
            .execute_query("workspace_lock", "workspace", || {
                sqlx::query(
                    "UPDATE workspaces SET locked_by = $3, lock_expires_at = $4 \
                     WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL \
                     AND (locked_by IS NULL OR lock_expires_at < NOW() OR locked_by = $3)",
                )
                .bind(workspace_id)
                .bind(tenant_id)
                .bind(holder)
                .bind(expires_at)
                .execute(db.writer())
            })
            .await?;

        if rows.rows_affected() == 0 {
            return Err(MeshError::new(
                ErrorKind::Conflict,
                format!("workspace {} is locked by another holder", workspace_id),
            )
            .with_resource("workspace")
            .with_context("workspace_id", workspace_id));
        }

        self.base
            .cache_delete(&[Self::entity_key(tenant_id, workspace_id)])
            .await;
        debug!(workspace_id = %workspace_id, holder, "Workspace lock acquired");
        Ok(())
    }

    /// Releases the lock when held by `holder`; releasing a lock you do
    /// not hold is a conflict.
    pub async fn release_lock(
        &self,
        tenant_id: Uuid,
        workspace_id: Uuid,
        holder: &str,
    ) -> Result<()> {
        let db = self.base.db().clone();
        let rows = self
            .base
            .execute_query("workspace_unlock", "workspace", || {
                sqlx::query(
                    "UPDATE workspaces SET locked_by = NULL, lock_expires_at = NULL \
                     WHERE id = $1 AND tenant_id = $2 AND locked_by = $3",
                )
                .bind(workspace_id)
                .bind(tenant_id)
                .bind(holder)
                .execute(db.writer())
            })
            .await?;

        if rows.rows_affected() == 0 {
            return Err(MeshError::new(
                ErrorKind::Conflict,
                format!("workspace {} is not locked by {}", workspace_id, holder),
            ));
        }

        self.base
            .cache_delete(&[Self::entity_key(tenant_id, workspace_id)])
            .await;
        Ok(())
    }

    // ============================================
    // ACTIVITY FEED
    // ============================================

    /// Appends an activity entry; best-effort context for auditing.
    pub async fn record_activity(
        &self,
        tenant_id: Uuid,
        workspace_id: Uuid,
        actor: &str,
        action: &str,
        details: Value,
    ) -> Result<()> {
        let db = self.base.db().clone();
        self.base
            .execute_query("activity_insert", "workspace_activity", || {
                sqlx::query(
                    "INSERT INTO workspace_activities \
                     (id, tenant_id, workspace_id, actor, action, details, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, NOW())",
                )
                .bind(Uuid::new_v4())
                .bind(tenant_id)
                .bind(workspace_id)
                .bind(actor)
                .bind(action)
                .bind(&details)
                .execute(db.writer())
            })
            .await?;
        Ok(())
    }

    /// Recent activity, newest first.
    pub async fn list_activities(
        &self,
        tenant_id: Uuid,
        workspace_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Value>> {
        let db = self.base.db().clone();
        let rows = self
            .base
            .execute_query("activity_list", "workspace_activity", || {
                sqlx::query_scalar::<_, Value>(
                    "SELECT jsonb_build_object(\
                        'id', id, 'actor', actor, 'action', action, \
                        'details', details, 'created_at', created_at) \
                     FROM workspace_activities \
                     WHERE tenant_id = $1 AND workspace_id = $2 \
                     ORDER BY created_at DESC LIMIT $3",
                )
                .bind(tenant_id)
                .bind(workspace_id)
                .bind(limit)
                .fetch_all(db.reader())
            })
            .await?;
        Ok(rows)
    }
}

fn sort_field(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|field| SORT_FIELDS.iter().find(|allowed| **allowed == field))
        .copied()
        .unwrap_or(DEFAULT_SORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_field_fallback() {
        assert_eq!(sort_field(Some("name")), "name");
        assert_eq!(sort_field(Some("locked_by")), "created_at");
        assert_eq!(sort_field(None), "created_at");
    }

    #[test]
    fn test_invalidation_keys() {
        let tenant = Uuid::new_v4();
        let id = Uuid::new_v4();
        let keys = WorkspaceRepository::invalidation_keys(tenant, id);

        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&format!("workspace:{}:{}", tenant, id)));
        assert!(keys.contains(&format!("workspace:members:{}", id)));
    }
}
