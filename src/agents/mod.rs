use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::task::{Task, TaskId};

pub mod coder;
pub mod planner;
pub mod tester;

pub use coder::CoderAgent;
pub use planner::PlannerAgent;
pub use tester::TesterAgent;

/// The worker specializations the pod routes tasks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Planner,
    Coder,
    Tester,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Planner, AgentKind::Coder, AgentKind::Tester];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Planner => "planner",
            AgentKind::Coder => "coder",
            AgentKind::Tester => "tester",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract every agent in the pod implements.
///
/// `process_task` receives a snapshot of the task and must produce a
/// response; it never mutates shared state. An `Err` is reconciled by the
/// coordinator exactly like an explicit failure response.
#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Short labels describing what the agent can do, for status output.
    fn capabilities(&self) -> &[&'static str];

    async fn process_task(&self, task: &Task) -> Result<AgentResponse>;
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent_kind: AgentKind,
    pub task_id: TaskId,
    pub success: bool,
    /// Opaque payload. Object fields are merged into the task's metadata
    /// when the task completes.
    pub result: Value,
    pub error: Option<String>,
    /// Advisory strings the follow-up policy inspects. Never required for
    /// correctness.
    pub suggestions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl AgentResponse {
    pub fn success(agent_kind: AgentKind, task_id: TaskId, result: Value) -> Self {
        Self {
            agent_kind,
            task_id,
            success: true,
            result,
            error: None,
            suggestions: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// A failed response always carries a non-empty error message.
    pub fn failure(agent_kind: AgentKind, task_id: TaskId, error: &str) -> Self {
        let message = if error.trim().is_empty() {
            "agent reported failure without details".to_string()
        } else {
            error.to_string()
        };
        Self {
            agent_kind,
            task_id,
            success: false,
            result: Value::Null,
            error: Some(message),
            suggestions: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }
}

/// A notification posted between agents. Delivery is fire-and-forget:
/// the pod logs receipt and nothing more.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub from: AgentKind,
    pub to: AgentKind,
    pub message_type: String,
    pub content: HashMap<String, Value>,
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(
        from: AgentKind,
        to: AgentKind,
        message_type: &str,
        content: HashMap<String, Value>,
    ) -> Self {
        Self {
            from,
            to,
            message_type: message_type.to_string(),
            content,
            task_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// A file extracted from model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub language: String,
    pub content: String,
}

/// Scan model output for `File: path` headers followed by fenced code
/// blocks. Fences without a preceding header get a guessed filename from
/// the language tag and `hint`. Blocks left unclosed at the end of the
/// text are discarded.
pub(crate) fn extract_file_blocks(text: &str, hint: &str) -> Vec<GeneratedFile> {
    let mut files = Vec::new();
    let mut pending_path: Option<String> = None;
    let mut in_block = false;
    let mut language = String::new();
    let mut content = String::new();

    for line in text.lines() {
        if in_block {
            if line.trim() == "```" {
                let path = pending_path
                    .take()
                    .unwrap_or_else(|| guess_filename(&language, hint, files.len()));
                files.push(GeneratedFile {
                    path,
                    language: language.clone(),
                    content: std::mem::take(&mut content),
                });
                in_block = false;
            } else {
                content.push_str(line);
                content.push('\n');
            }
        } else if let Some(tag) = line.trim_start().strip_prefix("```") {
            in_block = true;
            language = normalize_language(tag);
            content.clear();
        } else if let Some(path) = parse_file_header(line) {
            pending_path = Some(path);
        } else if !line.trim().is_empty() {
            // Prose between a header and its fence invalidates the header.
            pending_path = None;
        }
    }

    files
}

fn parse_file_header(line: &str) -> Option<String> {
    let trimmed = line
        .trim()
        .trim_start_matches("**")
        .trim_end_matches("**")
        .trim();
    let rest = ["File:", "file:", "Filename:", "filename:"]
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))?;
    let path = rest.trim().trim_matches('`').trim();
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

fn normalize_language(tag: &str) -> String {
    let tag = tag.trim();
    if tag.is_empty() {
        "text".to_string()
    } else {
        tag.to_lowercase()
    }
}

fn guess_filename(language: &str, hint: &str, index: usize) -> String {
    let extension = match language {
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "python" | "py" => "py",
        "rust" | "rs" => "rs",
        "go" => "go",
        "java" => "java",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "sql" => "sql",
        "bash" | "sh" | "shell" => "sh",
        _ => "txt",
    };

    let hint = hint.to_lowercase();
    let stem = if hint.contains("todo") {
        "todo"
    } else if hint.contains("test") {
        "tests"
    } else if hint.contains("app") {
        "app"
    } else if hint.contains("main") {
        "main"
    } else {
        "snippet"
    };

    if index == 0 {
        format!("{}.{}", stem, extension)
    } else {
        format!("{}_{}.{}", stem, index + 1, extension)
    }
}

/// First non-empty line of model output, truncated for payloads and logs.
pub(crate) fn summarize(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("(empty response)")
        .chars()
        .take(120)
        .collect()
}
