use std::pin::Pin;

use futures::Stream;

pub mod client;
mod sse;

pub use client::LlmClient;

/// A single completion request as seen by agents.
///
/// The client supplies the model name and wire framing; callers only pick
/// the prompt, an optional system message, and sampling parameters.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(prompt: &str) -> Self {
        Self {
            system: None,
            prompt: prompt.to_string(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_system(mut self, system: &str) -> Self {
        self.system = Some(system.to_string());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Stream of content fragments from a streaming completion.
///
/// Finite and non-restartable. Dropping the stream drops the underlying
/// HTTP response, which closes the connection.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Error types for the completion client.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API key not configured")]
    MissingApiKey,

    #[error("rate limited by the completion service")]
    RateLimited,

    #[error("request timed out")]
    Timeout,

    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    InvalidResponse(String),

    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl LlmError {
    /// Transient failures the client retries: rate limiting and timeouts.
    /// Everything else is returned to the caller immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::RateLimited | LlmError::Timeout)
    }
}
