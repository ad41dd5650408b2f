//! Generation provider abstraction and implementations.
//!
//! Defines the [`GenerationClient`] trait and concrete backends:
//! - **[`AnthropicGenerator`]** — calls the Anthropic Messages API.
//! - **[`OpenAiGenerator`]** — calls the OpenAI chat completions API.
//!
//! The LLM call is treated as untrusted and slow: every request carries a
//! timeout, transient failures (429/5xx, network faults) are retried with
//! bounded backoff, and exhausted retries surface as
//! [`GenerationError::ProviderUnavailable`]. Content-policy refusals are
//! never retried. Answers are not cached; generation is non-deterministic
//! across calls.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::GenerationError;
use crate::models::Turn;
use crate::retry::{with_backoff, Retry, RetryPolicy};

/// Default system instructions when `generation.system_prompt` is unset.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a study assistant for university students. \
Answer questions based only on the provided course material excerpts. \
If the excerpts do not contain the answer, say you don't know and suggest \
consulting the course materials. Be concise, accurate, and educational.";

/// The fully assembled input for one generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    /// Assembled retrieval context; may be empty when ungrounded answers
    /// are allowed.
    pub context: String,
    pub question: String,
    /// Prior turns of the conversation, oldest first. Empty unless history
    /// injection is enabled.
    pub history: Vec<Turn>,
}

impl GenerationRequest {
    /// Render the user-facing message: excerpts first, then the question.
    fn user_message(&self) -> String {
        if self.context.is_empty() {
            self.question.clone()
        } else {
            format!(
                "Here are relevant excerpts from the course materials:\n\n{}Question: {}",
                self.context, self.question
            )
        }
    }
}

/// A provider that turns (system, context, question) into an answer.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Model identifier (e.g. `"claude-sonnet-4-5"`).
    fn model_name(&self) -> &str;

    /// Generate an answer for the request.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

/// Create the configured [`GenerationClient`].
pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Arc<dyn GenerationClient>> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicGenerator::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        "disabled" => anyhow::bail!(
            "Generation provider is disabled. Set [generation] provider in config."
        ),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}

/// Classify an HTTP failure: 429/5xx transient, policy markers rejected,
/// anything else a permanent provider failure.
fn classify_status(status: reqwest::StatusCode, body: String) -> Retry<GenerationError> {
    if body.contains("content_policy") || body.contains("content_filter") {
        return Retry::Permanent(GenerationError::ContentPolicyRejected(body));
    }
    let message = format!("HTTP {status}: {body}");
    if status.as_u16() == 429 || status.is_server_error() {
        Retry::Transient(GenerationError::ProviderUnavailable(message))
    } else {
        Retry::Permanent(GenerationError::ProviderUnavailable(message))
    }
}

// ============ Anthropic ============

/// Generation client backed by `POST https://api.anthropic.com/v1/messages`.
///
/// Requires the `ANTHROPIC_API_KEY` environment variable.
pub struct AnthropicGenerator {
    model: String,
    max_tokens: usize,
    temperature: f64,
    api_key: String,
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl AnthropicGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Anthropic provider"))?;
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            api_key,
            url,
            client,
            policy: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.backoff_base_ms),
            ),
        })
    }
}

#[async_trait]
impl GenerationClient for AnthropicGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let mut messages = Vec::with_capacity(request.history.len() * 2 + 1);
        for turn in &request.history {
            messages.push(serde_json::json!({ "role": "user", "content": turn.question }));
            messages.push(serde_json::json!({ "role": "assistant", "content": turn.answer }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.user_message() }));

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "system": request.system,
            "messages": messages,
        });

        with_backoff(&self.policy, |attempt| {
            let body = &body;
            async move {
                if attempt > 0 {
                    debug!(attempt, model = %self.model, "retrying generation request");
                }
                let resp = self
                    .client
                    .post(&self.url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .header("Content-Type", "application/json")
                    .json(body)
                    .send()
                    .await;

                let response = match resp {
                    Ok(response) => response,
                    Err(err) => {
                        return Err(Retry::Transient(GenerationError::ProviderUnavailable(
                            err.to_string(),
                        )))
                    }
                };

                let status = response.status();
                if !status.is_success() {
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(classify_status(status, body_text));
                }

                let parsed: AnthropicResponse = response.json().await.map_err(|err| {
                    Retry::Permanent(GenerationError::ProviderUnavailable(format!(
                        "invalid response: {err}"
                    )))
                })?;

                if parsed.stop_reason.as_deref() == Some("refusal") {
                    return Err(Retry::Permanent(GenerationError::ContentPolicyRejected(
                        "model refused the request".to_string(),
                    )));
                }

                let answer: String = parsed
                    .content
                    .iter()
                    .filter_map(|block| block.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("");

                Ok(answer.trim().to_string())
            }
        })
        .await
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: Option<String>,
}

// ============ OpenAI ============

/// Generation client backed by `POST https://api.openai.com/v1/chat/completions`.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiGenerator {
    model: String,
    max_tokens: usize,
    temperature: f64,
    api_key: String,
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            api_key,
            url,
            client,
            policy: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.backoff_base_ms),
            ),
        })
    }
}

#[async_trait]
impl GenerationClient for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let mut messages = Vec::with_capacity(request.history.len() * 2 + 2);
        messages.push(serde_json::json!({ "role": "system", "content": request.system }));
        for turn in &request.history {
            messages.push(serde_json::json!({ "role": "user", "content": turn.question }));
            messages.push(serde_json::json!({ "role": "assistant", "content": turn.answer }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.user_message() }));

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": messages,
        });

        with_backoff(&self.policy, |attempt| {
            let body = &body;
            async move {
                if attempt > 0 {
                    debug!(attempt, model = %self.model, "retrying generation request");
                }
                let resp = self
                    .client
                    .post(&self.url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .header("Content-Type", "application/json")
                    .json(body)
                    .send()
                    .await;

                let response = match resp {
                    Ok(response) => response,
                    Err(err) => {
                        return Err(Retry::Transient(GenerationError::ProviderUnavailable(
                            err.to_string(),
                        )))
                    }
                };

                let status = response.status();
                if !status.is_success() {
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(classify_status(status, body_text));
                }

                let parsed: OpenAiChatResponse = response.json().await.map_err(|err| {
                    Retry::Permanent(GenerationError::ProviderUnavailable(format!(
                        "invalid response: {err}"
                    )))
                })?;

                let choice = parsed.choices.into_iter().next().ok_or_else(|| {
                    Retry::Permanent(GenerationError::ProviderUnavailable(
                        "empty choices in response".to_string(),
                    ))
                })?;

                if choice.finish_reason.as_deref() == Some("content_filter") {
                    return Err(Retry::Permanent(GenerationError::ContentPolicyRejected(
                        "response stopped by content filter".to_string(),
                    )));
                }

                Ok(choice.message.content.trim().to_string())
            }
        })
        .await
    }
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: String,
}
