use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use devpod::agents::{Agent, AgentKind, AgentResponse};
use devpod::task::{Task, TaskStatus, META_ERROR, META_PARENT_TASK_ID, META_PROJECT_PATH};
use devpod::{Coordinator, Error, LlmError, PodConfig, Result};

fn test_config() -> PodConfig {
    PodConfig {
        max_concurrent_tasks: 2,
        agent_timeout_secs: 5,
        queue_poll_interval_ms: 50,
        admission_backoff_ms: 25,
        idle_sleep_ms: 10,
        ..PodConfig::default()
    }
}

/// Poll until nothing is active or queued and the completed bucket has
/// reached the expected size.
async fn drain(coordinator: &Coordinator, expect_completed: usize) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let status = coordinator.coordinator_status().await;
            if status.active_tasks == 0
                && status.queue_depth == 0
                && status.completed_tasks >= expect_completed
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("pod did not settle in time");
}

/// Tracks how many tasks run at once, then succeeds after a delay.
struct CountingAgent {
    kind: AgentKind,
    delay: Duration,
    current: Arc<AtomicUsize>,
    high_water: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for CountingAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn capabilities(&self) -> &[&'static str] {
        &["counting"]
    }

    async fn process_task(&self, task: &Task) -> Result<AgentResponse> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(AgentResponse::success(self.kind, task.id, json!({})))
    }
}

/// Succeeds immediately, recording the status each task arrived with
/// and attaching a fixed set of suggestions.
struct ScriptedAgent {
    kind: AgentKind,
    suggestions: Vec<String>,
    observed: Arc<Mutex<Vec<TaskStatus>>>,
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn capabilities(&self) -> &[&'static str] {
        &["scripted"]
    }

    async fn process_task(&self, task: &Task) -> Result<AgentResponse> {
        self.observed.lock().unwrap().push(task.status);
        Ok(
            AgentResponse::success(self.kind, task.id, json!({"done": true}))
                .with_suggestions(self.suggestions.clone()),
        )
    }
}

fn scripted(kind: AgentKind, suggestions: Vec<String>) -> (Arc<ScriptedAgent>, Arc<Mutex<Vec<TaskStatus>>>) {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let agent = Arc::new(ScriptedAgent {
        kind,
        suggestions,
        observed: Arc::clone(&observed),
    });
    (agent, observed)
}

/// Reports failure through the response rather than an error.
struct FailingAgent {
    kind: AgentKind,
}

#[async_trait]
impl Agent for FailingAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn capabilities(&self) -> &[&'static str] {
        &[]
    }

    async fn process_task(&self, task: &Task) -> Result<AgentResponse> {
        Ok(AgentResponse::failure(self.kind, task.id, "boom"))
    }
}

/// Returns an error instead of a response.
struct ErroringAgent {
    kind: AgentKind,
}

#[async_trait]
impl Agent for ErroringAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn capabilities(&self) -> &[&'static str] {
        &[]
    }

    async fn process_task(&self, _task: &Task) -> Result<AgentResponse> {
        Err(LlmError::RetriesExhausted { attempts: 4 }.into())
    }
}

/// Sleeps past the agent timeout on its first task, then answers fast.
struct OnceSleepyAgent {
    kind: AgentKind,
    delay: Duration,
    first: AtomicBool,
}

#[async_trait]
impl Agent for OnceSleepyAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn capabilities(&self) -> &[&'static str] {
        &[]
    }

    async fn process_task(&self, task: &Task) -> Result<AgentResponse> {
        if self.first.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        Ok(AgentResponse::success(self.kind, task.id, json!({})))
    }
}

/// Panics on its first task, then answers normally.
struct PanicOnceAgent {
    kind: AgentKind,
    first: AtomicBool,
}

#[async_trait]
impl Agent for PanicOnceAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn capabilities(&self) -> &[&'static str] {
        &[]
    }

    async fn process_task(&self, task: &Task) -> Result<AgentResponse> {
        if self.first.swap(false, Ordering::SeqCst) {
            panic!("kaboom");
        }
        Ok(AgentResponse::success(self.kind, task.id, json!({})))
    }
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let current = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let agent = Arc::new(CountingAgent {
        kind: AgentKind::Coder,
        delay: Duration::from_millis(300),
        current: Arc::clone(&current),
        high_water: Arc::clone(&high_water),
    });
    let coordinator = Coordinator::with_agents(test_config(), vec![agent as Arc<dyn Agent>]);
    coordinator.start().await;

    for i in 0..12 {
        coordinator
            .submit(&format!("job {i}"), "", HashMap::new())
            .await
            .unwrap();
    }
    drain(&coordinator, 12).await;
    coordinator.shutdown().await;

    assert_eq!(high_water.load(Ordering::SeqCst), 2);
    let status = coordinator.coordinator_status().await;
    assert_eq!(status.completed_tasks, 12);
    assert_eq!(status.active_tasks, 0);
}

#[tokio::test]
async fn test_task_lifecycle_runs_forward() {
    let (agent, observed) = scripted(AgentKind::Coder, vec![]);
    let coordinator = Coordinator::with_agents(test_config(), vec![agent as Arc<dyn Agent>]);

    let id = coordinator.submit("job", "", HashMap::new()).await.unwrap();
    let snapshot = coordinator.get_status(id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Pending);

    coordinator.start().await;
    drain(&coordinator, 1).await;
    coordinator.shutdown().await;

    assert_eq!(observed.lock().unwrap().as_slice(), &[TaskStatus::InProgress]);
    let snapshot = coordinator.get_status(id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.assigned_agent, Some(AgentKind::Coder));
    // The agent's result object is merged into the task metadata.
    assert_eq!(snapshot.metadata.get("done"), Some(&json!(true)));
}

#[tokio::test]
async fn test_reported_failure_lands_in_metadata() {
    let agent = Arc::new(FailingAgent {
        kind: AgentKind::Coder,
    });
    let coordinator = Coordinator::with_agents(test_config(), vec![agent as Arc<dyn Agent>]);
    coordinator.start().await;

    let id = coordinator
        .submit("doomed job", "", HashMap::new())
        .await
        .unwrap();
    drain(&coordinator, 1).await;
    coordinator.shutdown().await;

    let snapshot = coordinator.get_status(id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(
        snapshot.metadata.get(META_ERROR).and_then(|v| v.as_str()),
        Some("boom")
    );
}

#[tokio::test]
async fn test_agent_error_is_recorded_with_context() {
    let agent = Arc::new(ErroringAgent {
        kind: AgentKind::Coder,
    });
    let coordinator = Coordinator::with_agents(test_config(), vec![agent as Arc<dyn Agent>]);
    coordinator.start().await;

    let id = coordinator.submit("job", "", HashMap::new()).await.unwrap();
    drain(&coordinator, 1).await;
    coordinator.shutdown().await;

    let snapshot = coordinator.get_status(id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Failed);
    let error = snapshot
        .metadata
        .get(META_ERROR)
        .and_then(|v| v.as_str())
        .unwrap();
    assert!(error.contains("agent failed"), "got: {error}");
    assert!(error.contains("retries exhausted"), "got: {error}");
}

#[tokio::test]
async fn test_timeout_fails_task_and_frees_slot() {
    let agent = Arc::new(OnceSleepyAgent {
        kind: AgentKind::Coder,
        delay: Duration::from_secs(10),
        first: AtomicBool::new(true),
    });
    let config = PodConfig {
        max_concurrent_tasks: 1,
        agent_timeout_secs: 1,
        ..test_config()
    };
    let coordinator = Coordinator::with_agents(config, vec![agent as Arc<dyn Agent>]);
    coordinator.start().await;

    let slow = coordinator
        .submit("job one", "", HashMap::new())
        .await
        .unwrap();
    let quick = coordinator
        .submit("job two", "", HashMap::new())
        .await
        .unwrap();
    drain(&coordinator, 2).await;
    coordinator.shutdown().await;

    let slow = coordinator.get_status(slow).await.unwrap();
    assert_eq!(slow.status, TaskStatus::Failed);
    let error = slow
        .metadata
        .get(META_ERROR)
        .and_then(|v| v.as_str())
        .unwrap();
    assert!(error.contains("timed out"), "got: {error}");

    // The slot was released: the queued task still ran to completion.
    let quick = coordinator.get_status(quick).await.unwrap();
    assert_eq!(quick.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_agent_panic_does_not_take_down_the_pod() {
    let agent = Arc::new(PanicOnceAgent {
        kind: AgentKind::Coder,
        first: AtomicBool::new(true),
    });
    let config = PodConfig {
        max_concurrent_tasks: 1,
        ..test_config()
    };
    let coordinator = Coordinator::with_agents(config, vec![agent as Arc<dyn Agent>]);
    coordinator.start().await;

    let first = coordinator
        .submit("job one", "", HashMap::new())
        .await
        .unwrap();
    let second = coordinator
        .submit("job two", "", HashMap::new())
        .await
        .unwrap();
    drain(&coordinator, 2).await;
    coordinator.shutdown().await;

    let first = coordinator.get_status(first).await.unwrap();
    assert_eq!(first.status, TaskStatus::Failed);
    let error = first
        .metadata
        .get(META_ERROR)
        .and_then(|v| v.as_str())
        .unwrap();
    assert!(error.contains("panicked"), "got: {error}");

    let second = coordinator.get_status(second).await.unwrap();
    assert_eq!(second.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_missing_agent_fails_the_task() {
    let coordinator = Coordinator::new(test_config());
    coordinator.start().await;

    let id = coordinator
        .submit("plain job", "", HashMap::new())
        .await
        .unwrap();
    drain(&coordinator, 1).await;
    coordinator.shutdown().await;

    let snapshot = coordinator.get_status(id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Failed);
    let error = snapshot
        .metadata
        .get(META_ERROR)
        .and_then(|v| v.as_str())
        .unwrap();
    assert!(error.contains("no agent registered"), "got: {error}");
}

#[tokio::test]
async fn test_test_suggestion_spawns_one_follow_up() {
    let (coder, _) = scripted(
        AgentKind::Coder,
        vec!["Consider writing unit tests for the generated code".to_string()],
    );
    let (tester, _) = scripted(AgentKind::Tester, vec![]);
    let coordinator = Coordinator::with_agents(
        test_config(),
        vec![coder as Arc<dyn Agent>, tester as Arc<dyn Agent>],
    );
    coordinator.start().await;

    let metadata = HashMap::from([(META_PROJECT_PATH.to_string(), json!("/workspace/notes"))]);
    let parent = coordinator
        .submit("build the notes app", "", metadata)
        .await
        .unwrap();
    drain(&coordinator, 2).await;
    coordinator.shutdown().await;

    let tasks = coordinator.list_tasks().await;
    assert_eq!(tasks.completed.len(), 2);

    let parent_id = parent.to_string();
    let follow_ups: Vec<_> = tasks
        .completed
        .iter()
        .filter(|t| {
            t.metadata.get(META_PARENT_TASK_ID).and_then(|v| v.as_str())
                == Some(parent_id.as_str())
        })
        .collect();
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(follow_ups[0].title, "Test build the notes app");
    assert_eq!(follow_ups[0].status, TaskStatus::Completed);
    // Follow-ups inherit the parent's project path.
    assert_eq!(
        follow_ups[0].metadata.get(META_PROJECT_PATH),
        Some(&json!("/workspace/notes"))
    );
}

#[tokio::test]
async fn test_each_suggestion_spawns_its_own_follow_up() {
    let (coder, _) = scripted(
        AgentKind::Coder,
        vec!["test this".to_string(), "review this".to_string()],
    );
    let (tester, _) = scripted(AgentKind::Tester, vec![]);
    let coordinator = Coordinator::with_agents(
        test_config(),
        vec![coder as Arc<dyn Agent>, tester as Arc<dyn Agent>],
    );
    coordinator.start().await;

    let parent = coordinator
        .submit("build the notes app", "", HashMap::new())
        .await
        .unwrap();
    drain(&coordinator, 3).await;
    coordinator.shutdown().await;

    let tasks = coordinator.list_tasks().await;
    assert_eq!(tasks.completed.len(), 3);

    let parent_id = parent.to_string();
    let mut titles: Vec<_> = tasks
        .completed
        .iter()
        .filter(|t| {
            t.metadata.get(META_PARENT_TASK_ID).and_then(|v| v.as_str())
                == Some(parent_id.as_str())
        })
        .map(|t| t.title.clone())
        .collect();
    titles.sort();
    assert_eq!(
        titles,
        vec!["Review build the notes app", "Test build the notes app"]
    );
}

#[tokio::test]
async fn test_status_reports_agents_and_limits() {
    let (coder, _) = scripted(AgentKind::Coder, vec![]);
    let (tester, _) = scripted(AgentKind::Tester, vec![]);
    let coordinator = Coordinator::with_agents(
        test_config(),
        vec![coder as Arc<dyn Agent>, tester as Arc<dyn Agent>],
    );

    let status = coordinator.coordinator_status().await;
    assert!(!status.running);
    assert_eq!(status.max_concurrent_tasks, 2);
    assert_eq!(status.agents.len(), 2);
    assert_eq!(status.agents[0].kind, AgentKind::Coder);
    assert_eq!(status.agents[0].capabilities, vec!["scripted"]);
    assert_eq!(status.agents[1].kind, AgentKind::Tester);

    // start is idempotent.
    coordinator.start().await;
    coordinator.start().await;
    assert!(coordinator.coordinator_status().await.running);

    coordinator.shutdown().await;
    assert!(!coordinator.coordinator_status().await.running);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_tasks() {
    let current = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let agent = Arc::new(CountingAgent {
        kind: AgentKind::Coder,
        delay: Duration::from_millis(400),
        current: Arc::clone(&current),
        high_water: Arc::clone(&high_water),
    });
    let coordinator = Coordinator::with_agents(test_config(), vec![agent as Arc<dyn Agent>]);
    coordinator.start().await;

    coordinator
        .submit("job one", "", HashMap::new())
        .await
        .unwrap();
    coordinator
        .submit("job two", "", HashMap::new())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while current.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tasks were not admitted in time");

    coordinator.shutdown().await;

    let status = coordinator.coordinator_status().await;
    assert!(!status.running);
    assert_eq!(status.completed_tasks, 2);
    assert_eq!(status.active_tasks, 0);
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let (coder, _) = scripted(AgentKind::Coder, vec![]);
    let coordinator = Coordinator::with_agents(test_config(), vec![coder as Arc<dyn Agent>]);
    coordinator.start().await;
    coordinator.shutdown().await;

    let err = coordinator
        .submit("late job", "", HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Shutdown));

    // A rejected submission must not be left visible anywhere.
    let tasks = coordinator.list_tasks().await;
    assert!(tasks.active.is_empty());
    assert!(tasks.completed.is_empty());
}
