use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::AgentKind;
use crate::error::{Error, Result};

/// Pod-wide configuration.
///
/// Values come from three layers, each overriding the previous: built-in
/// defaults, an optional `~/.config/devpod/config.toml`, and environment
/// variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodConfig {
    pub llm: LlmConfig,
    /// Upper bound on tasks processed concurrently.
    pub max_concurrent_tasks: usize,
    /// Wall-clock limit for a single agent invocation.
    pub agent_timeout_secs: u64,
    pub planner_temperature: f32,
    pub coder_temperature: f32,
    pub tester_temperature: f32,
    pub queue_poll_interval_ms: u64,
    pub admission_backoff_ms: u64,
    pub idle_sleep_ms: u64,
    pub message_capacity: usize,
    pub monitor_interval_secs: u64,
}

/// Connection settings for the OpenAI-compatible completion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Minimum spacing between request starts, shared by all callers.
    pub min_request_interval_ms: u64,
    /// Retries after the initial attempt for rate-limit and timeout errors.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            max_concurrent_tasks: 3,
            agent_timeout_secs: 300,
            planner_temperature: 0.7,
            coder_temperature: 0.3,
            tester_temperature: 0.5,
            queue_poll_interval_ms: 1_000,
            admission_backoff_ms: 2_000,
            idle_sleep_ms: 500,
            message_capacity: 64,
            monitor_interval_secs: 30,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "llama-3.3-70b-versatile".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            request_timeout_secs: 30,
            min_request_interval_ms: 1_000,
            max_retries: 3,
            retry_base_delay_ms: 2_000,
        }
    }
}

impl PodConfig {
    /// Load configuration: defaults, then the config file if present, then
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_file_path() {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)?;
                toml::from_str(&content)?
            }
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overlay environment variables via `get`, which is injected so tests
    /// never touch process-global state.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(key) = get("GROQ_API_KEY") {
            if !key.is_empty() {
                self.llm.api_key = Some(key);
            }
        }
        if let Some(model) = get("GROQ_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = get("GROQ_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(raw) = get("MAX_CONCURRENT_AGENTS") {
            self.max_concurrent_tasks = parse_var("MAX_CONCURRENT_AGENTS", &raw)?;
        }
        if let Some(raw) = get("AGENT_TIMEOUT") {
            self.agent_timeout_secs = parse_var("AGENT_TIMEOUT", &raw)?;
        }
        if let Some(raw) = get("PLANNER_TEMPERATURE") {
            self.planner_temperature = parse_var("PLANNER_TEMPERATURE", &raw)?;
        }
        if let Some(raw) = get("CODER_TEMPERATURE") {
            self.coder_temperature = parse_var("CODER_TEMPERATURE", &raw)?;
        }
        if let Some(raw) = get("TESTER_TEMPERATURE") {
            self.tester_temperature = parse_var("TESTER_TEMPERATURE", &raw)?;
        }
        Ok(())
    }

    fn config_file_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("devpod").join("config.toml"))
    }

    pub fn temperature_for(&self, kind: AgentKind) -> f32 {
        match kind {
            AgentKind::Planner => self.planner_temperature,
            AgentKind::Coder => self.coder_temperature,
            AgentKind::Tester => self.tester_temperature,
        }
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn admission_backoff(&self) -> Duration {
        Duration::from_millis(self.admission_backoff_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{}: invalid value `{}`", name, raw)))
}
