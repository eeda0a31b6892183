//! An autonomous development pod: planner, coder, and tester agents that
//! take natural-language tasks and build software together.
//!
//! The [`coordinator::Coordinator`] accepts tasks, routes each one to an
//! agent by keyword, bounds how many run at once, and records every
//! outcome in its task registry. Agents talk to an OpenAI-compatible
//! completion service through [`llm::LlmClient`], which rate-limits and
//! retries on its own.

pub mod agents;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod llm;
pub mod task;

pub use agents::{Agent, AgentKind, AgentMessage, AgentResponse, GeneratedFile};
pub use config::{LlmConfig, PodConfig};
pub use coordinator::{Coordinator, CoordinatorStatus, TaskList, TaskSnapshot};
pub use error::{Error, Result};
pub use llm::{CompletionRequest, LlmClient, LlmError};
pub use task::{Task, TaskId, TaskStatus};
