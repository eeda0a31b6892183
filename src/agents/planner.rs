use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::agents::{Agent, AgentKind, AgentResponse};
use crate::error::Result;
use crate::llm::{CompletionRequest, LlmClient};
use crate::task::Task;

const SYSTEM_PROMPT: &str = "You are a senior software architect. You break vague \
requirements into concrete, actionable engineering plans. Be specific and terse; \
prefer numbered steps over prose.";

const CAPABILITIES: &[&str] = &[
    "task_analysis",
    "project_planning",
    "task_breakdown",
    "architecture_design",
];

/// Turns a raw request into an analysis and a numbered implementation plan.
pub struct PlannerAgent {
    client: Arc<LlmClient>,
    temperature: f32,
}

impl PlannerAgent {
    pub fn new(client: Arc<LlmClient>, temperature: f32) -> Self {
        Self {
            client,
            temperature,
        }
    }

    fn analysis_prompt(task: &Task) -> String {
        format!(
            "Analyze the following development task.\n\n\
             Task: {}\n\
             Details: {}\n\n\
             Cover: the core requirement, the main components involved, \
             likely risks, and what \"done\" looks like.",
            task.title, task.description
        )
    }

    fn plan_prompt(task: &Task, analysis: &str) -> String {
        format!(
            "Based on this analysis, produce a numbered implementation plan \
             for the task \"{}\". Each step should be something a single \
             developer can finish in one sitting.\n\nAnalysis:\n{}",
            task.title, analysis
        )
    }

    /// Advisory hints derived from the plan text alone.
    fn derive_suggestions(plan: &str) -> Vec<String> {
        let mut suggestions = Vec::new();
        if !plan.to_lowercase().contains("test") {
            suggestions.push("Consider adding testing tasks to verify the plan".to_string());
        }
        let steps = plan
            .lines()
            .filter(|line| {
                line.trim_start()
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit())
            })
            .count();
        if steps > 8 {
            suggestions.push("Plan is large; split follow-on work into phases".to_string());
        }
        suggestions
    }
}

#[async_trait]
impl Agent for PlannerAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Planner
    }

    fn capabilities(&self) -> &[&'static str] {
        CAPABILITIES
    }

    async fn process_task(&self, task: &Task) -> Result<AgentResponse> {
        debug!(task_id = %task.id, "planner analyzing requirements");
        let analysis = self
            .client
            .generate(
                &CompletionRequest::new(&Self::analysis_prompt(task))
                    .with_system(SYSTEM_PROMPT)
                    .with_temperature(self.temperature),
            )
            .await?;

        debug!(task_id = %task.id, "planner drafting implementation plan");
        let plan = self
            .client
            .generate(
                &CompletionRequest::new(&Self::plan_prompt(task, &analysis))
                    .with_system(SYSTEM_PROMPT)
                    .with_temperature(self.temperature),
            )
            .await?;

        let suggestions = Self::derive_suggestions(&plan);
        let payload = json!({
            "analysis": analysis,
            "plan": plan,
        });
        Ok(AgentResponse::success(AgentKind::Planner, task.id, payload)
            .with_suggestions(suggestions))
    }
}
