use std::collections::VecDeque;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::LlmConfig;

use super::sse::{collect_fragments, SseScanner};
use super::{CompletionRequest, LlmError, TextStream};

/// Upper bound on the random jitter added to each retry delay.
const MAX_JITTER_MS: u64 = 1_000;

// Chat-completions wire structures.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Client for an OpenAI-compatible chat-completions service.
///
/// One instance is shared by every agent in the pod. It spaces out request
/// starts to respect the provider's rate limits and retries transient
/// failures with exponential backoff. All timing state lives on the
/// instance; there are no globals.
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
    /// Instant the most recent request started, across all callers.
    last_request_start: Mutex<Option<Instant>>,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;

        Ok(Self {
            http,
            config,
            last_request_start: Mutex::new(None),
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Run a completion to the end and return the assistant's content.
    ///
    /// Rate-limit rejections and transport timeouts are retried up to the
    /// configured limit; exhaustion returns [`LlmError::RetriesExhausted`].
    /// An empty content string is a successful response, not an error.
    pub async fn generate(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let mut attempt: u32 = 0;
        loop {
            self.pace().await;
            match self.send_completion(request).await {
                Ok(content) => return Ok(content),
                Err(err) if err.is_retryable() => {
                    if attempt >= self.config.max_retries {
                        return Err(LlmError::RetriesExhausted {
                            attempts: attempt + 1,
                        });
                    }
                    let delay = backoff_delay(self.config.retry_base_delay(), attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient completion failure, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Start a streaming completion and return the fragment stream.
    ///
    /// Retries apply only until the response begins; the stream itself is
    /// finite and cannot be restarted. Dropping it closes the connection.
    pub async fn stream_generate(
        &self,
        request: &CompletionRequest,
    ) -> Result<TextStream, LlmError> {
        let mut attempt: u32 = 0;
        let response = loop {
            self.pace().await;
            match self.post_chat(request, true).await {
                Ok(response) => break response,
                Err(err) if err.is_retryable() => {
                    if attempt >= self.config.max_retries {
                        return Err(LlmError::RetriesExhausted {
                            attempts: attempt + 1,
                        });
                    }
                    let delay = backoff_delay(self.config.retry_base_delay(), attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient stream-start failure, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        let body = Box::pin(response.bytes_stream());
        let state = (body, SseScanner::new(), VecDeque::new(), false);
        let stream = futures::stream::unfold(
            state,
            |(mut body, mut scanner, mut pending, mut done)| async move {
                loop {
                    if let Some(text) = pending.pop_front() {
                        return Some((Ok(text), (body, scanner, pending, done)));
                    }
                    if done {
                        return None;
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => {
                            if collect_fragments(&mut scanner, &chunk, &mut pending) {
                                done = true;
                            }
                        }
                        Some(Err(err)) => {
                            done = true;
                            return Some((
                                Err(classify_transport(err)),
                                (body, scanner, pending, done),
                            ));
                        }
                        None => done = true,
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    /// List model ids the service exposes.
    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let api_key = self.api_key()?;
        let url = format!("{}/models", self.config.base_url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(classify_transport)?;
        let response = check_status(response).await?;

        let parsed: ModelsResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }

    /// Probe connectivity with a one-token completion.
    pub async fn check_connection(&self) -> Result<(), LlmError> {
        let probe = CompletionRequest::new("ping")
            .with_temperature(0.0)
            .with_max_tokens(1);
        self.generate(&probe).await.map(|_| ())
    }

    /// Wait out the minimum inter-request interval and stamp the new start.
    /// The lock is held across the wait so concurrent callers are spaced
    /// out one after another.
    async fn pace(&self) {
        let mut last = self.last_request_start.lock().await;
        if let Some(started) = *last {
            let interval = self.config.min_request_interval();
            let elapsed = started.elapsed();
            if elapsed < interval {
                let wait = interval - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "pacing completion request");
                sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn send_completion(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let response = self.post_chat(request, false).await?;
        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?;
        Ok(choice.message.content.unwrap_or_default())
    }

    async fn post_chat(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let api_key = self.api_key()?;
        let url = format!("{}/chat/completions", self.config.base_url);

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: request.prompt.clone(),
        });

        let body = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        check_status(response).await
    }

    fn api_key(&self) -> Result<&str, LlmError> {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(LlmError::MissingApiKey)
    }
}

/// Delay before retry `attempt` (0-indexed): exponential growth from the
/// base plus up to one second of uniform jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS));
    exponential + jitter
}

fn classify_transport(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Network(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(LlmError::RateLimited);
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}
