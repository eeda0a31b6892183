//! Task coordination: queueing, admission control, routing, dispatch,
//! and reconciliation of worker outcomes.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agents::{Agent, AgentKind, AgentMessage, CoderAgent, PlannerAgent, TesterAgent};
use crate::config::PodConfig;
use crate::error::{Error, Result};
use crate::llm::LlmClient;
use crate::task::{Task, TaskId, TaskStatus, META_ERROR, META_PARENT_TASK_ID, META_PROJECT_PATH};

pub mod registry;
pub mod routing;

pub use registry::TaskRegistry;
pub use routing::route;

/// Read model of one task, returned by the status APIs.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl From<Task> for TaskSnapshot {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            title: task.title,
            status: task.status,
            assigned_agent: task.assigned_agent,
            created_at: task.created_at,
            updated_at: task.updated_at,
            metadata: task.metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskList {
    pub active: Vec<TaskSnapshot>,
    pub completed: Vec<TaskSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub kind: AgentKind,
    pub capabilities: Vec<String>,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub queue_depth: usize,
    pub max_concurrent_tasks: usize,
    pub agents: Vec<AgentStatus>,
}

/// State shared between the public API and the background loops.
struct Shared {
    config: PodConfig,
    registry: TaskRegistry,
    agents: HashMap<AgentKind, Arc<dyn Agent>>,
    queue_tx: mpsc::UnboundedSender<TaskId>,
    queue_depth: AtomicUsize,
    message_tx: mpsc::Sender<AgentMessage>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

/// Orchestrates the pod: accepts tasks, routes each to an agent, bounds
/// how many run at once, and records every outcome in the registry.
///
/// `submit` and the status APIs work before, during, and after the
/// background loops run; `start` spawns the loops and `shutdown` stops
/// admission and waits for in-flight tasks to finish.
pub struct Coordinator {
    shared: Arc<Shared>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskId>>>,
    message_rx: Mutex<Option<mpsc::Receiver<AgentMessage>>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Coordinator with no agents registered. Tasks submitted to it fail
    /// at dispatch, so this is mostly useful with [`Coordinator::with_agents`].
    pub fn new(config: PodConfig) -> Self {
        Self::with_agents(config, Vec::new())
    }

    /// Coordinator with the three standard agents sharing one LLM client.
    pub fn with_default_agents(config: PodConfig) -> Result<Self> {
        let client = Arc::new(LlmClient::new(config.llm.clone())?);
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(PlannerAgent::new(
                Arc::clone(&client),
                config.temperature_for(AgentKind::Planner),
            )),
            Arc::new(CoderAgent::new(
                Arc::clone(&client),
                config.temperature_for(AgentKind::Coder),
            )),
            Arc::new(TesterAgent::new(
                client,
                config.temperature_for(AgentKind::Tester),
            )),
        ];
        Ok(Self::with_agents(config, agents))
    }

    /// Coordinator around an explicit set of agents, keyed by kind.
    pub fn with_agents(config: PodConfig, agents: Vec<Arc<dyn Agent>>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::channel(config.message_capacity.max(1));
        let agents = agents
            .into_iter()
            .map(|agent| (agent.kind(), agent))
            .collect();

        Self {
            shared: Arc::new(Shared {
                config,
                registry: TaskRegistry::new(),
                agents,
                queue_tx,
                queue_depth: AtomicUsize::new(0),
                message_tx,
                shutdown: CancellationToken::new(),
                running: AtomicBool::new(false),
            }),
            queue_rx: Mutex::new(Some(queue_rx)),
            message_rx: Mutex::new(Some(message_rx)),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Register a task and enqueue it for dispatch. The task is visible
    /// via `get_status` as Pending immediately, before any agent runs.
    pub async fn submit(
        &self,
        title: &str,
        description: &str,
        metadata: HashMap<String, Value>,
    ) -> Result<TaskId> {
        self.shared
            .enqueue(Task::new(title, description).with_metadata(metadata))
            .await
    }

    pub async fn get_status(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.shared.registry.get(id).await.map(TaskSnapshot::from)
    }

    pub async fn list_tasks(&self) -> TaskList {
        let (active, completed) = self.shared.registry.snapshot().await;
        TaskList {
            active: active.into_iter().map(TaskSnapshot::from).collect(),
            completed: completed.into_iter().map(TaskSnapshot::from).collect(),
        }
    }

    pub async fn coordinator_status(&self) -> CoordinatorStatus {
        let (active, completed) = self.shared.registry.snapshot().await;
        let mut in_flight: HashMap<AgentKind, usize> = HashMap::new();
        for task in &active {
            if task.status == TaskStatus::InProgress {
                if let Some(kind) = task.assigned_agent {
                    *in_flight.entry(kind).or_default() += 1;
                }
            }
        }

        let mut agents: Vec<AgentStatus> = self
            .shared
            .agents
            .values()
            .map(|agent| AgentStatus {
                kind: agent.kind(),
                capabilities: agent
                    .capabilities()
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
                in_flight: in_flight.get(&agent.kind()).copied().unwrap_or(0),
            })
            .collect();
        agents.sort_by_key(|status| status.kind.as_str());

        CoordinatorStatus {
            running: self.shared.running.load(Ordering::SeqCst),
            active_tasks: active.len(),
            completed_tasks: completed.len(),
            queue_depth: self.shared.queue_depth.load(Ordering::SeqCst),
            max_concurrent_tasks: self.shared.config.max_concurrent_tasks,
            agents,
        }
    }

    /// Post a fire-and-forget message between agents. A full or closed
    /// channel drops the message with a warning; this never blocks.
    pub fn send_message(
        &self,
        from: AgentKind,
        to: AgentKind,
        message_type: &str,
        content: HashMap<String, Value>,
        task_id: Option<TaskId>,
    ) {
        let mut message = AgentMessage::new(from, to, message_type, content);
        if let Some(id) = task_id {
            message = message.for_task(id);
        }
        if let Err(err) = self.shared.message_tx.try_send(message) {
            warn!(%from, %to, message_type, "dropping agent message: {}", err);
        }
    }

    /// Spawn the dispatch, message-pump, and monitor loops. A second call
    /// is a no-op.
    pub async fn start(&self) {
        let Some(queue_rx) = self.queue_rx.lock().await.take() else {
            debug!("coordinator already started");
            return;
        };
        let Some(message_rx) = self.message_rx.lock().await.take() else {
            return;
        };

        self.shared.running.store(true, Ordering::SeqCst);
        let mut loops = self.loops.lock().await;
        loops.push(tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            queue_rx,
        )));
        loops.push(tokio::spawn(message_pump(
            Arc::clone(&self.shared),
            message_rx,
        )));
        loops.push(tokio::spawn(monitor_loop(Arc::clone(&self.shared))));
        info!(
            max_concurrent = self.shared.config.max_concurrent_tasks,
            agents = self.shared.agents.len(),
            "coordinator started"
        );
    }

    /// Stop admitting tasks, let in-flight work finish, and wait for the
    /// background loops to exit.
    pub async fn shutdown(&self) {
        info!("coordinator shutting down");
        self.shared.shutdown.cancel();
        self.shared.running.store(false, Ordering::SeqCst);
        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            if let Err(err) = handle.await {
                error!("coordinator loop panicked: {}", err);
            }
        }
        info!("coordinator stopped");
    }
}

impl Shared {
    async fn enqueue(&self, task: Task) -> Result<TaskId> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let id = task.id;
        let title = task.title.clone();
        self.registry.put(task).await?;
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(id).is_err() {
            // Closed queue: the task never reached the loop, so a rejected
            // submission must not stay visible in the registry.
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            self.registry.discard(id).await;
            return Err(Error::Shutdown);
        }
        info!(task_id = %id, title = %title, "task submitted");
        Ok(id)
    }

    fn requeue(&self, id: TaskId) {
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(id).is_err() {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn agent(&self, kind: AgentKind) -> Option<Arc<dyn Agent>> {
        self.agents.get(&kind).cloned()
    }

    /// Run one admitted task to its terminal status. Success, explicit
    /// failure, error, timeout, and panic all end with the task moved out
    /// of the active in-progress set, releasing its admission slot.
    async fn process_one(&self, agent: Arc<dyn Agent>, task: Task) {
        let id = task.id;
        let kind = agent.kind();
        let started = Instant::now();

        let outcome = timeout(
            self.config.agent_timeout(),
            AssertUnwindSafe(agent.process_task(&task)).catch_unwind(),
        )
        .await;

        let result = match outcome {
            Err(_) => Err(Error::AgentExecution {
                kind,
                task_id: id,
                message: format!("timed out after {:?}", self.config.agent_timeout()),
            }),
            Ok(Err(panic)) => Err(Error::AgentExecution {
                kind,
                task_id: id,
                message: format!("agent panicked: {}", panic_message(&panic)),
            }),
            Ok(Ok(response)) => response.map_err(|err| Error::AgentExecution {
                kind,
                task_id: id,
                message: err.to_string(),
            }),
        };

        match result {
            Ok(response) if response.success => {
                let patch = match &response.result {
                    Value::Object(fields) => fields.clone().into_iter().collect(),
                    _ => HashMap::new(),
                };
                match self.registry.complete(id, TaskStatus::Completed, patch).await {
                    Ok(finished) => {
                        info!(
                            task_id = %id,
                            agent = %kind,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "task completed"
                        );
                        self.spawn_follow_ups(&finished, &response.suggestions).await;
                    }
                    Err(err) => error!(task_id = %id, "could not record completion: {}", err),
                }
            }
            Ok(response) => {
                let message = response
                    .error
                    .unwrap_or_else(|| "agent reported failure without details".to_string());
                self.fail_task(id, &message).await;
            }
            Err(err) => self.fail_task(id, &err.to_string()).await,
        }
    }

    async fn fail_task(&self, id: TaskId, message: &str) {
        let patch = HashMap::from([(
            META_ERROR.to_string(),
            Value::String(message.to_string()),
        )]);
        match self.registry.complete(id, TaskStatus::Failed, patch).await {
            Ok(task) => {
                warn!(task_id = %id, title = %task.title, "task failed: {}", message);
            }
            Err(err) => error!(task_id = %id, "could not record failure: {}", err),
        }
    }

    async fn spawn_follow_ups(&self, parent: &Task, suggestions: &[String]) {
        for task in follow_up_tasks(parent, suggestions) {
            let title = task.title.clone();
            match self.enqueue(task).await {
                Ok(id) => {
                    info!(parent = %parent.id, task_id = %id, title = %title, "follow-up queued");
                }
                Err(err) => {
                    warn!(parent = %parent.id, "could not queue follow-up: {}", err);
                }
            }
        }
    }
}

/// Derive follow-up tasks from a completed task's suggestions.
///
/// Each suggestion is matched independently and the first rule wins:
/// mentioning "test" spawns a test task, otherwise "review" or "check"
/// spawns a review task. Matching is case-insensitive; duplicate
/// suggestions spawn duplicate tasks. Follow-ups carry the parent's id
/// and project path in their metadata.
fn follow_up_tasks(parent: &Task, suggestions: &[String]) -> Vec<Task> {
    let mut tasks = Vec::new();
    for suggestion in suggestions {
        let lowered = suggestion.to_lowercase();
        let (title, description) = if lowered.contains("test") {
            (
                format!("Test {}", parent.title),
                format!("Create and run tests for: {}", parent.title),
            )
        } else if lowered.contains("review") || lowered.contains("check") {
            (
                format!("Review {}", parent.title),
                format!("Review and validate: {}", parent.title),
            )
        } else {
            continue;
        };

        let metadata = HashMap::from([
            (
                META_PARENT_TASK_ID.to_string(),
                Value::String(parent.id.to_string()),
            ),
            (
                META_PROJECT_PATH.to_string(),
                Value::String(parent.project_path()),
            ),
        ]);
        tasks.push(Task::new(&title, &description).with_metadata(metadata));
    }
    tasks
}

/// Pop task ids, admit them under the concurrency bound, and hand each to
/// its agent. Only this loop admits tasks, so checking the in-progress
/// count and marking the task in-progress back to back is race-free.
async fn dispatch_loop(shared: Arc<Shared>, mut queue_rx: mpsc::UnboundedReceiver<TaskId>) {
    let mut workers = JoinSet::new();
    debug!("dispatch loop running");

    loop {
        // Reap finished workers so the set doesn't grow without bound.
        while workers.try_join_next().is_some() {}

        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            polled = timeout(shared.config.queue_poll_interval(), queue_rx.recv()) => polled,
        };

        let id = match next {
            Ok(Some(id)) => id,
            Ok(None) => break,
            Err(_) => {
                // Queue idle; nap before polling again.
                if sleep_or_shutdown(&shared.shutdown, shared.config.idle_sleep()).await {
                    break;
                }
                continue;
            }
        };
        shared.queue_depth.fetch_sub(1, Ordering::SeqCst);

        if shared.registry.in_progress_count().await >= shared.config.max_concurrent_tasks {
            // At capacity: push the id back to the tail and back off. The
            // task keeps its place among re-enqueued ids but newer
            // submissions may overtake it.
            debug!(task_id = %id, "at capacity, re-enqueueing");
            shared.requeue(id);
            if sleep_or_shutdown(&shared.shutdown, shared.config.admission_backoff()).await {
                break;
            }
            continue;
        }

        if let Err(err) = admit(&shared, &mut workers, id).await {
            error!(task_id = %id, "dispatch failed: {}", err);
        }
    }

    // Admission has stopped; in-flight tasks run to completion.
    if !workers.is_empty() {
        info!(in_flight = workers.len(), "draining in-flight tasks");
    }
    while workers.join_next().await.is_some() {}
    debug!("dispatch loop stopped");
}

async fn admit(shared: &Arc<Shared>, workers: &mut JoinSet<()>, id: TaskId) -> Result<()> {
    let task = shared
        .registry
        .get(id)
        .await
        .ok_or(Error::UnknownTask(id))?;
    let kind = routing::route(&task);

    let Some(agent) = shared.agent(kind) else {
        let err = Error::NoAgentForKind(kind);
        warn!(task_id = %id, agent = %kind, "{}", err);
        shared.registry.mark_in_progress(id, kind).await?;
        shared.fail_task(id, &err.to_string()).await;
        return Ok(());
    };

    let task = shared.registry.mark_in_progress(id, kind).await?;
    info!(task_id = %id, agent = %kind, title = %task.title, "task started");

    let shared = Arc::clone(shared);
    workers.spawn(async move {
        shared.process_one(agent, task).await;
    });
    Ok(())
}

/// Log every agent message; delivery is the whole contract.
async fn message_pump(shared: Arc<Shared>, mut message_rx: mpsc::Receiver<AgentMessage>) {
    loop {
        let message = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            received = message_rx.recv() => match received {
                Some(message) => message,
                None => break,
            },
        };
        debug!(
            from = %message.from,
            to = %message.to,
            message_type = %message.message_type,
            task_id = ?message.task_id.map(|id| id.short()),
            "agent message delivered"
        );
    }
    debug!("message pump stopped");
}

/// Periodically log pod health: bucket sizes, queue depth, and per-agent
/// in-flight counts.
async fn monitor_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.monitor_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (active, completed) = shared.registry.snapshot().await;
        let in_progress = active
            .iter()
            .filter(|task| task.status == TaskStatus::InProgress)
            .count();
        debug!(
            active = active.len(),
            in_progress,
            completed = completed.len(),
            queue_depth = shared.queue_depth.load(Ordering::SeqCst),
            "pod status"
        );
        for agent in shared.agents.values() {
            let in_flight = active
                .iter()
                .filter(|task| {
                    task.status == TaskStatus::InProgress
                        && task.assigned_agent == Some(agent.kind())
                })
                .count();
            debug!(
                agent = %agent.kind(),
                capabilities = agent.capabilities().len(),
                in_flight,
                "agent status"
            );
        }
    }
    debug!("monitor loop stopped");
}

/// Sleep unless shutdown fires first; returns true on shutdown.
async fn sleep_or_shutdown(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
