//! Task data model.
//!
//! Tasks are the unit of work the coordinator schedules. Each task tracks
//! its lifecycle status, the agent kind it was routed to, timestamps, and
//! a free-form metadata map that accumulates over the task's life.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agents::AgentKind;

/// Metadata key that carries the working directory for generated work.
pub const META_PROJECT_PATH: &str = "project_path";
/// Metadata key linking a follow-up task to the task that spawned it.
pub const META_PARENT_TASK_ID: &str = "parent_task_id";
/// Metadata key holding the failure message of a failed task.
pub const META_ERROR: &str = "error";

/// Unique identifier for a task within the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID, for log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task lifecycle status.
///
/// Legal transitions move forward only: `Pending -> InProgress ->
/// {Completed, Failed}`. `Cancelled` is part of the model for external
/// consumers but no coordinator API currently produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A unit of development work tracked by the pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, fixed at creation.
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Agent kind this task was routed to, set on dispatch.
    pub assigned_agent: Option<AgentKind>,
    /// Declared prerequisites. Recorded and serialized for consumers, but
    /// the dispatch loop does not gate execution on them.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Accumulates over the task's life; merges may replace a key's value
    /// but entries are never dropped.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Task {
    /// Create a Pending task with a fresh id and current timestamps.
    pub fn new(title: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Begin execution: InProgress, assigned to `kind`.
    pub fn start(&mut self, kind: AgentKind) {
        self.status = TaskStatus::InProgress;
        self.assigned_agent = Some(kind);
        self.touch();
    }

    /// Apply a terminal status.
    pub fn finish(&mut self, status: TaskStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.touch();
    }

    /// Merge `patch` into the metadata map. Existing keys are overwritten,
    /// everything else is preserved.
    pub fn merge_metadata(&mut self, patch: HashMap<String, Value>) {
        if patch.is_empty() {
            return;
        }
        self.metadata.extend(patch);
        self.touch();
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Working directory recorded for this task, defaulting to the current
    /// directory when none was supplied.
    pub fn project_path(&self) -> String {
        self.metadata
            .get(META_PROJECT_PATH)
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
