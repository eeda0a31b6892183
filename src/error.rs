use thiserror::Error;

use crate::agents::AgentKind;
use crate::llm::LlmError;
use crate::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("no agent registered for kind: {0}")]
    NoAgentForKind(AgentKind),

    #[error("{kind} agent failed on task {task_id}: {message}")]
    AgentExecution {
        kind: AgentKind,
        task_id: TaskId,
        message: String,
    },

    #[error("LLM request failed: {0}")]
    Llm(#[from] LlmError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("coordinator is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
