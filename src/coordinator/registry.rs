use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::agents::AgentKind;
use crate::error::{Error, Result};
use crate::task::{Task, TaskId, TaskStatus};

#[derive(Default)]
struct Buckets {
    active: HashMap<TaskId, Task>,
    completed: HashMap<TaskId, Task>,
}

/// Canonical store for every task the pod has accepted.
///
/// Tasks sit in the active bucket from submission until a terminal status
/// is recorded, then move to the completed bucket exactly once. Nothing
/// is ever deleted. One lock covers both buckets, so a task is never
/// visible in two places at the same time.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RwLock<Buckets>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly submitted task.
    pub async fn put(&self, task: Task) -> Result<()> {
        let mut buckets = self.inner.write().await;
        if buckets.active.contains_key(&task.id) || buckets.completed.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        buckets.active.insert(task.id, task);
        Ok(())
    }

    /// Roll back a submission whose queue handoff failed. Pulls from the
    /// active bucket only; completed tasks are never removed.
    pub(crate) async fn discard(&self, id: TaskId) -> Option<Task> {
        self.inner.write().await.active.remove(&id)
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        let buckets = self.inner.read().await;
        buckets
            .active
            .get(&id)
            .or_else(|| buckets.completed.get(&id))
            .cloned()
    }

    /// Transition an active task to in-progress and hand back a clone for
    /// the worker.
    pub async fn mark_in_progress(&self, id: TaskId, kind: AgentKind) -> Result<Task> {
        let mut buckets = self.inner.write().await;
        let task = buckets.active.get_mut(&id).ok_or(Error::UnknownTask(id))?;
        task.start(kind);
        Ok(task.clone())
    }

    /// Apply a terminal status and move the task out of the active bucket.
    ///
    /// `UnknownTask` when the id is not active, which also rejects a
    /// second completion of the same task.
    pub async fn complete(
        &self,
        id: TaskId,
        status: TaskStatus,
        patch: HashMap<String, Value>,
    ) -> Result<Task> {
        let mut buckets = self.inner.write().await;
        let mut task = buckets.active.remove(&id).ok_or(Error::UnknownTask(id))?;
        task.merge_metadata(patch);
        task.finish(status);
        let snapshot = task.clone();
        buckets.completed.insert(id, task);
        Ok(snapshot)
    }

    /// Point-in-time copy of both buckets, each ordered by creation time.
    pub async fn snapshot(&self) -> (Vec<Task>, Vec<Task>) {
        let buckets = self.inner.read().await;
        let mut active: Vec<Task> = buckets.active.values().cloned().collect();
        let mut completed: Vec<Task> = buckets.completed.values().cloned().collect();
        active.sort_by_key(|task| task.created_at);
        completed.sort_by_key(|task| task.created_at);
        (active, completed)
    }

    pub async fn active_len(&self) -> usize {
        self.inner.read().await.active.len()
    }

    pub async fn completed_len(&self) -> usize {
        self.inner.read().await.completed.len()
    }

    /// Tasks a worker is currently processing. The active bucket also
    /// holds pending tasks, so admission control counts statuses rather
    /// than bucket size.
    pub async fn in_progress_count(&self) -> usize {
        self.inner
            .read()
            .await
            .active
            .values()
            .filter(|task| task.status == TaskStatus::InProgress)
            .count()
    }
}
