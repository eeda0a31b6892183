use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::agents::{extract_file_blocks, summarize, Agent, AgentKind, AgentResponse};
use crate::error::Result;
use crate::llm::{CompletionRequest, LlmClient};
use crate::task::Task;

const SYSTEM_PROMPT: &str = "You are a meticulous QA engineer. Write runnable test \
suites that cover happy paths, edge cases, and failure modes. Emit every file as a \
line `File: relative/path` followed by a fenced code block tagged with the language.";

const CAPABILITIES: &[&str] = &["test_generation", "coverage_analysis"];

/// Writes test suites for previously produced work.
///
/// Suggestions from this agent deliberately avoid the follow-up trigger
/// words so a test task never schedules another one.
pub struct TesterAgent {
    client: Arc<LlmClient>,
    temperature: f32,
}

impl TesterAgent {
    pub fn new(client: Arc<LlmClient>, temperature: f32) -> Self {
        Self {
            client,
            temperature,
        }
    }

    fn generation_prompt(task: &Task) -> String {
        format!(
            "Write tests for the following task.\n\n\
             Task: {}\n\
             Details: {}\n\
             Project directory: {}\n\n\
             Output each test file with a `File:` header and a fenced code \
             block. Include a one-line summary of what the suite covers.",
            task.title,
            task.description,
            task.project_path()
        )
    }
}

#[async_trait]
impl Agent for TesterAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Tester
    }

    fn capabilities(&self) -> &[&'static str] {
        CAPABILITIES
    }

    async fn process_task(&self, task: &Task) -> Result<AgentResponse> {
        debug!(task_id = %task.id, "tester writing suites");
        let output = self
            .client
            .generate(
                &CompletionRequest::new(&Self::generation_prompt(task))
                    .with_system(SYSTEM_PROMPT)
                    .with_temperature(self.temperature),
            )
            .await?;

        let files = extract_file_blocks(&output, "tests");
        debug!(task_id = %task.id, files = files.len(), "tester finished");

        let suggestions = if files.is_empty() {
            vec!["Model produced no suites; inspect the raw output".to_string()]
        } else {
            vec!["Run the new suites locally before merging".to_string()]
        };
        let payload = json!({
            "test_files": files,
            "test_file_count": files.len(),
            "summary": summarize(&output),
        });
        Ok(AgentResponse::success(AgentKind::Tester, task.id, payload)
            .with_suggestions(suggestions))
    }
}
