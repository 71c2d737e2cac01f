//! Domain entities persisted by the repositories
//!
//! Every primary entity carries the shared columns: `id`, `tenant_id`,
//! `version` (bumped by exactly one on every successful update),
//! `created_at`, `updated_at`, and the soft-delete marker `deleted_at`.
//! State columns are JSON blobs; tags are string sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================
// STATUS ENUMS
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// Task lifecycle state machine. Terminal states never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Accepted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Accepted => "accepted",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "assigned" => Some(Self::Assigned),
            "accepted" => Some(Self::Accepted),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Allowed transitions of the fixed state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Assigned) | (Pending, Cancelled) => true,
            (Assigned, Accepted) | (Assigned, Cancelled) | (Assigned, Timeout) => true,
            (Accepted, InProgress) | (Accepted, Cancelled) | (Accepted, Timeout) => true,
            (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Cancelled)
            | (InProgress, Timeout) => true,
            _ => false,
        }
    }
}

// ============================================
// ENTITIES
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Status string; see [`WorkflowStatus`].
    pub status: String,
    /// Workflow definition: steps, edges, triggers.
    pub definition: Value,
    pub tags: Vec<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(tenant_id: Uuid, name: impl Into<String>, definition: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            description: None,
            status: WorkflowStatus::Draft.as_str().to_string(),
            definition,
            tags: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn workflow_status(&self) -> Option<WorkflowStatus> {
        WorkflowStatus::parse(&self.status)
    }
}

/// A run of a workflow; nested under its workflow aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub status: String,
    /// Execution state blob; step status lives under `steps.{step_id}`.
    pub state: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(tenant_id: Uuid, workflow_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            workflow_id,
            status: ExecutionStatus::Pending.as_str().to_string(),
            state: serde_json::json!({ "steps": {} }),
            started_at: None,
            completed_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workspace {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub settings: Value,
    pub tags: Vec<String>,
    /// Exclusive-lock pair; both set while a holder owns the workspace.
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Workspace {
    pub fn new(tenant_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            description: None,
            status: "active".to_string(),
            settings: serde_json::json!({}),
            tags: Vec::new(),
            locked_by: None,
            lock_expires_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkspaceMember {
    pub workspace_id: Uuid,
    pub user_id: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    /// Status string; see [`TaskStatus`].
    pub status: String,
    pub priority: i32,
    pub assignee: Option<String>,
    pub payload: Value,
    pub tags: Vec<String>,
    pub workflow_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(tenant_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            title: title.into(),
            description: None,
            status: TaskStatus::Pending.as_str().to_string(),
            priority: 0,
            assignee: None,
            payload: serde_json::json!({}),
            tags: Vec::new(),
            workflow_id: None,
            started_at: None,
            completed_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn task_status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SharedDocument {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub title: String,
    pub content_type: String,
    pub content: Value,
    pub tags: Vec<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SharedDocument {
    pub fn new(tenant_id: Uuid, title: impl Into<String>, content: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            workspace_id: None,
            title: title.into(),
            content_type: "application/json".to_string(),
            content,
            tags: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Append-only edit log entry for a shared document.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DocumentOperation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub document_id: Uuid,
    pub sequence: i64,
    pub author: String,
    pub operation: Value,
    pub created_at: DateTime<Utc>,
}

/// Periodic materialization of a document at a sequence point.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DocumentSnapshot {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub document_id: Uuid,
    pub sequence: i64,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}
