//! Shared-document repository
//!
//! Documents with an append-only operation log and periodic snapshots.
//! Operations carry a per-document sequence assigned inside a transaction;
//! snapshots materialize the content at a sequence point so readers do not
//! replay the whole log.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorKind, MeshError, Result};

use super::base::BaseRepository;
use super::entities::{DocumentOperation, DocumentSnapshot, SharedDocument};
use super::ListOptions;

const COLUMNS: &str = "id, tenant_id, workspace_id, title, content_type, content, tags, \
                       version, created_at, updated_at, deleted_at";

const OPERATION_COLUMNS: &str = "id, tenant_id, document_id, sequence, author, operation, \
                                 created_at";

const SNAPSHOT_COLUMNS: &str = "id, tenant_id, document_id, sequence, content, created_at";

const SORT_FIELDS: &[&str] = &["created_at", "updated_at", "title"];
const DEFAULT_SORT: &str = "updated_at";

/// Repository for shared documents.
pub struct DocumentRepository {
    base: Arc<BaseRepository>,
}

impl DocumentRepository {
    pub fn new(base: Arc<BaseRepository>) -> Self {
        Self { base }
    }

    fn entity_key(tenant_id: Uuid, id: Uuid) -> String {
        format!("document:{}:{}", tenant_id, id)
    }

    fn list_key(tenant_id: Uuid) -> String {
        format!("document:list:{}", tenant_id)
    }

    fn invalidation_keys(tenant_id: Uuid, id: Uuid) -> Vec<String> {
        vec![
            Self::entity_key(tenant_id, id),
            Self::list_key(tenant_id),
            format!("document:operations:{}", id),
        ]
    }

    // ============================================
    // CRUD
    // ============================================

    pub async fn create(&self, document: &SharedDocument) -> Result<SharedDocument> {
        let sql = self.base.statement("document_insert", || {
            format!(
                "INSERT INTO shared_documents ({COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 1, NOW(), NOW(), NULL) \
                 RETURNING {COLUMNS}"
            )
        });

        let db = self.base.db().clone();
        let created = self
            .base
            .execute_query("document_create", "shared_document", || {
                sqlx::query_as::<_, SharedDocument>(&sql)
                    .bind(document.id)
                    .bind(document.tenant_id)
                    .bind(document.workspace_id)
                    .bind(&document.title)
                    .bind(&document.content_type)
                    .bind(&document.content)
                    .bind(&document.tags)
                    .fetch_one(db.writer())
            })
            .await?;

        self.base
            .cache_delete(&[Self::list_key(document.tenant_id)])
            .await;
        self.base
            .cache_set(&Self::entity_key(created.tenant_id, created.id), &created)
            .await;

        info!(document_id = %created.id, "Document created");
        Ok(created)
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<SharedDocument> {
        let key = Self::entity_key(tenant_id, id);
        match self.base.cache_get::<SharedDocument>(&key).await {
            Ok(cached) => return Ok(cached),
            Err(err) if err.kind == ErrorKind::CacheMiss => {}
            Err(err) => debug!(error = %err, "Cache read failed, falling through"),
        }

        let sql = self.base.statement("document_get", || {
            format!(
                "SELECT {COLUMNS} FROM shared_documents \
                 WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL"
            )
        });

        let db = self.base.db().clone();
        let found = self
            .base
            .execute_query("document_get", "shared_document", || {
                sqlx::query_as::<_, SharedDocument>(&sql)
                    .bind(id)
                    .bind(tenant_id)
                    .fetch_optional(db.reader())
            })
            .await?
            .ok_or_else(|| MeshError::not_found("shared_document", id))?;

        self.base.cache_set(&key, &found).await;
        Ok(found)
    }

    /// Version-gated content update.
    pub async fn update(&self, document: &SharedDocument) -> Result<SharedDocument> {
        let sql = self.base.statement("document_update", || {
            format!(
                "UPDATE shared_documents SET title = $4, content_type = $5, content = $6, \
                 tags = $7, version = version + 1, updated_at = NOW() \
                 WHERE id = $1 AND tenant_id = $2 AND version = $3 AND deleted_at IS NULL \
                 RETURNING {COLUMNS}"
            )
        });

        let db = self.base.db().clone();
        let updated = self
            .base
            .execute_query("document_update", "shared_document", || {
                sqlx::query_as::<_, SharedDocument>(&sql)
                    .bind(document.id)
                    .bind(document.tenant_id)
                    .bind(document.version)
                    .bind(&document.title)
                    .bind(&document.content_type)
                    .bind(&document.content)
                    .bind(&document.tags)
                    .fetch_optional(db.writer())
            })
            .await?;

        let updated = match updated {
            Some(row) => row,
            None => {
                let db = self.base.db().clone();
                let exists = self
                    .base
                    .execute_query("document_exists", "shared_document", || {
                        sqlx::query_scalar::<_, bool>(
                            "SELECT EXISTS(SELECT 1 FROM shared_documents \
                             WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL)",
                        )
                        .bind(document.id)
                        .bind(document.tenant_id)
                        .fetch_one(db.writer())
                    })
                    .await?;
                return Err(if exists {
                    MeshError::optimistic_lock("shared_document", document.id)
                } else {
                    MeshError::not_found("shared_document", document.id)
                });
            }
        };

        self.base
            .cache_delete(&Self::invalidation_keys(document.tenant_id, document.id))
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
            .execute_query("document_soft_delete", "shared_document", || {
                sqlx::query(
                    "UPDATE shared_documents SET deleted_at = NOW(), \
                     version = version + 1, updated_at = NOW() \
                     WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
                )
                .bind(id)
                .bind(tenant_id)
                .execute(db.writer())
            })
            .await?;

        if rows.rows_affected() == 0 {
            return Err(MeshError::not_found("shared_document", id));
        }

        self.base
            .cache_delete(&Self::invalidation_keys(tenant_id, id))
            .await;
        Ok(())
    }

    pub async fn list(&self, tenant_id: Uuid, opts: &ListOptions) -> Result<Vec<SharedDocument>> {
        let sort = sort_field(opts.sort_by.as_deref());
        let direction = if opts.descending { "DESC" } else { "ASC" };

        let sql = format!(
            "SELECT {COLUMNS} FROM shared_documents \
             WHERE tenant_id = $1 AND deleted_at IS NULL \
             ORDER BY {sort} {direction} LIMIT $2 OFFSET $3"
        );

        let db = self.base.db().clone();
        self.base
            .execute_query("document_list", "shared_document", || {
                sqlx::query_as::<_, SharedDocument>(&sql)
                    .bind(tenant_id)
                    .bind(opts.limit)
                    .bind(opts.offset.unwrap_or(0))
                    .fetch_all(db.reader())
            })
            .await
    }

    /// Title search within a tenant, optionally scoped to a workspace.
    pub async fn search(
        &self,
        tenant_id: Uuid,
        workspace_id: Option<Uuid>,
        query: &str,
        opts: &ListOptions,
    ) -> Result<Vec<SharedDocument>> {
        let sort = sort_field(opts.sort_by.as_deref());
        let direction = if opts.descending { "DESC" } else { "ASC" };
        let pattern = format!("%{}%", query);

        let sql = format!(
            "SELECT {COLUMNS} FROM shared_documents \
             WHERE tenant_id = $1 AND deleted_at IS NULL \
             AND ($2::uuid IS NULL OR workspace_id = $2) \
             AND (title ILIKE $3 OR $4 = ANY(tags)) \
             ORDER BY {sort} {direction} LIMIT $5 OFFSET $6"
        );

        let db = self.base.db().clone();
        self.base
            .execute_query("document_search", "shared_document", || {
                sqlx::query_as::<_, SharedDocument>(&sql)
                    .bind(tenant_id)
                    .bind(workspace_id)
                    .bind(&pattern)
                    .bind(query)
                    .bind(opts.limit)
                    .bind(opts.offset.unwrap_or(0))
                    .fetch_all(db.reader())
            })
            .await
    }

    // ============================================
    // OPERATION LOG
    // ============================================

    /// Appends an operation with the next per-document sequence number,
    /// transactionally.
    pub async fn append_operation(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
        author: &str,
        operation: Value,
    ) -> Result<DocumentOperation> {
        let author = author.to_string();

        let appended = self
            .base
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let next_sequence: i64 = sqlx::query_scalar(
                        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM document_operations \
                         WHERE document_id = $1",
                    )
                    .bind(document_id)
                    .fetch_one(tx.conn()?)
                    .await?;

                    let appended = sqlx::query_as::<_, DocumentOperation>(&format!(
                        "INSERT INTO document_operations ({OPERATION_COLUMNS}) \
                         VALUES ($1, $2, $3, $4, $5, $6, NOW()) \
                         RETURNING {OPERATION_COLUMNS}"
                    ))
                    .bind(Uuid::new_v4())
                    .bind(tenant_id)
                    .bind(document_id)
                    .bind(next_sequence)
                    .bind(&author)
                    .bind(&operation)
                    .fetch_one(tx.conn()?)
                    .await?;

                    Ok(appended)
                })
            })
            .await?;

        self.base
            .cache_delete(&[format!("document:operations:{}", document_id)])
            .await;

        Ok(appended)
    }

    /// Operations after a sequence point, oldest first.
    pub async fn operations_since(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
        after_sequence: i64,
        limit: i64,
    ) -> Result<Vec<DocumentOperation>> {
        let sql = self.base.statement("operations_since", || {
            format!(
                "SELECT {OPERATION_COLUMNS} FROM document_operations \
                 WHERE tenant_id = $1 AND document_id = $2 AND sequence > $3 \
                 ORDER BY sequence ASC LIMIT $4"
            )
        });

        let db = self.base.db().clone();
        self.base
            .execute_query("operations_since", "document_operation", || {
                sqlx::query_as::<_, DocumentOperation>(&sql)
                    .bind(tenant_id)
                    .bind(document_id)
                    .bind(after_sequence)
                    .bind(limit)
                    .fetch_all(db.reader())
            })
            .await
    }

    // ============================================
    // SNAPSHOTS
    // ============================================

    /// Materializes the document content at a sequence point.
    pub async fn create_snapshot(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
        sequence: i64,
        content: Value,
    ) -> Result<DocumentSnapshot> {
        let sql = self.base.statement("snapshot_insert", || {
            format!(
                "INSERT INTO document_snapshots ({SNAPSHOT_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, NOW()) \
                 RETURNING {SNAPSHOT_COLUMNS}"
            )
        });

        let db = self.base.db().clone();
        self.base
            .execute_query("snapshot_create", "document_snapshot", || {
                sqlx::query_as::<_, DocumentSnapshot>(&sql)
                    .bind(Uuid::new_v4())
                    .bind(tenant_id)
                    .bind(document_id)
                    .bind(sequence)
                    .bind(&content)
                    .fetch_one(db.writer())
            })
            .await
    }

    /// The most recent snapshot, if any.
    pub async fn latest_snapshot(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
    ) -> Result<Option<DocumentSnapshot>> {
        let sql = self.base.statement("snapshot_latest", || {
            format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM document_snapshots \
                 WHERE tenant_id = $1 AND document_id = $2 \
                 ORDER BY sequence DESC LIMIT 1"
            )
        });

        let db = self.base.db().clone();
        self.base
            .execute_query("snapshot_latest", "document_snapshot", || {
                sqlx::query_as::<_, DocumentSnapshot>(&sql)
                    .bind(tenant_id)
                    .bind(document_id)
                    .fetch_optional(db.reader())
            })
            .await
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
        assert_eq!(sort_field(Some("title")), "title");
        assert_eq!(sort_field(Some("content")), "updated_at");
        assert_eq!(sort_field(None), "updated_at");
    }

    #[test]
    fn test_invalidation_keys_cover_operations() {
        let tenant = Uuid::new_v4();
        let id = Uuid::new_v4();
        let keys = DocumentRepository::invalidation_keys(tenant, id);
        assert!(keys.contains(&format!("document:operations:{}", id)));
    }
}
