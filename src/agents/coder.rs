use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::agents::{extract_file_blocks, summarize, Agent, AgentKind, AgentResponse};
use crate::error::Result;
use crate::llm::{CompletionRequest, LlmClient};
use crate::task::Task;

const SYSTEM_PROMPT: &str = "You are an expert software developer. Write complete, \
working code with no placeholders. Emit every file as a line `File: relative/path` \
followed by a fenced code block tagged with the language.";

const CAPABILITIES: &[&str] = &["code_generation", "refactoring", "debugging"];

/// Produces source files for a task and reports them as structured output.
pub struct CoderAgent {
    client: Arc<LlmClient>,
    temperature: f32,
}

impl CoderAgent {
    pub fn new(client: Arc<LlmClient>, temperature: f32) -> Self {
        Self {
            client,
            temperature,
        }
    }

    fn generation_prompt(task: &Task) -> String {
        format!(
            "Implement the following task.\n\n\
             Task: {}\n\
             Details: {}\n\
             Project directory: {}\n\n\
             Output each file with a `File:` header and a fenced code block. \
             Include a one-line summary before the first file.",
            task.title,
            task.description,
            task.project_path()
        )
    }
}

#[async_trait]
impl Agent for CoderAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Coder
    }

    fn capabilities(&self) -> &[&'static str] {
        CAPABILITIES
    }

    async fn process_task(&self, task: &Task) -> Result<AgentResponse> {
        debug!(task_id = %task.id, "coder generating implementation");
        let output = self
            .client
            .generate(
                &CompletionRequest::new(&Self::generation_prompt(task))
                    .with_system(SYSTEM_PROMPT)
                    .with_temperature(self.temperature),
            )
            .await?;

        let files = extract_file_blocks(&output, &task.title);
        debug!(task_id = %task.id, files = files.len(), "coder finished");

        let suggestions = if files.is_empty() {
            vec!["Model produced no files; inspect the raw output".to_string()]
        } else {
            vec!["Consider writing unit tests for the generated code".to_string()]
        };
        let payload = json!({
            "files": files,
            "file_count": files.len(),
            "summary": summarize(&output),
        });
        Ok(AgentResponse::success(AgentKind::Coder, task.id, payload)
            .with_suggestions(suggestions))
    }
}
