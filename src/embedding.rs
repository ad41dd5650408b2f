//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingClient`] trait and concrete backends:
//! - **[`OpenAiEmbedder`]** — calls the OpenAI embeddings API with batching,
//!   retry, and backoff.
//! - **[`OllamaEmbedder`]** — calls a local Ollama instance's `/api/embed`
//!   endpoint.
//!
//! Providers are selected once at startup via [`create_embedder`]; nothing
//! downstream inspects provider types at runtime.
//!
//! Also provides vector utilities shared with the store:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 encoding for
//!   SQLite BLOB storage
//!
//! # Retry Strategy
//!
//! HTTP 429 and 5xx responses and network faults are retried with bounded
//! exponential backoff (see [`crate::retry`]); any other 4xx fails
//! immediately as a permanent rejection.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;
use crate::retry::{with_backoff, Retry, RetryPolicy};

/// A provider that turns text into fixed-dimension vectors.
///
/// Guarantees: output order matches input order, and every vector has
/// [`dims`](EmbeddingClient::dims) elements. Calls are idempotent for
/// identical input under a fixed model.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, preserving input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Create the configured [`EmbeddingClient`].
///
/// # Errors
///
/// Fails for the `disabled` provider (the query pipeline cannot run
/// without embeddings), unknown provider names, or missing credentials.
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingClient>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "disabled" => anyhow::bail!(
            "Embedding provider is disabled. Set [embedding] provider in config."
        ),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

fn check_dims(vectors: &[Vec<f32>], expected: usize) -> Result<(), EmbeddingError> {
    for vector in vectors {
        if vector.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
    }
    Ok(())
}

/// Classify an HTTP failure for the retry wrapper: 429/5xx transient,
/// other statuses permanent.
fn classify_status(status: reqwest::StatusCode, body: String) -> Retry<EmbeddingError> {
    let message = format!("HTTP {status}: {body}");
    if status.as_u16() == 429 || status.is_server_error() {
        Retry::Transient(EmbeddingError::Unavailable(message))
    } else {
        Retry::Permanent(EmbeddingError::Rejected(message))
    }
}

// ============ OpenAI ============

/// Embedding client backed by `POST https://api.openai.com/v1/embeddings`.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    api_key: String,
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/embeddings".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            batch_size: config.batch_size.max(1),
            api_key,
            url,
            client,
            policy: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.backoff_base_ms),
            ),
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": batch,
        });

        with_backoff(&self.policy, |attempt| {
            let body = &body;
            async move {
                if attempt > 0 {
                    debug!(attempt, model = %self.model, "retrying embedding request");
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
                        return Err(Retry::Transient(EmbeddingError::Unavailable(
                            err.to_string(),
                        )))
                    }
                };

                let status = response.status();
                if !status.is_success() {
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(classify_status(status, body_text));
                }

                let parsed: OpenAiEmbeddingResponse = response.json().await.map_err(|err| {
                    Retry::Permanent(EmbeddingError::InvalidResponse(err.to_string()))
                })?;

                let mut data = parsed.data;
                data.sort_by_key(|item| item.index);
                Ok(data.into_iter().map(|item| item.embedding).collect())
            }
        })
        .await
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        check_dims(&vectors, self.dims)?;
        Ok(vectors)
    }
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

// ============ Ollama ============

/// Embedding client backed by a local Ollama instance's `POST /api/embed`.
///
/// Requires Ollama to be running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            batch_size: config.batch_size.max(1),
            url,
            client,
            policy: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.backoff_base_ms),
            ),
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": batch,
        });

        with_backoff(&self.policy, |attempt| {
            let body = &body;
            async move {
                if attempt > 0 {
                    debug!(attempt, model = %self.model, "retrying embedding request");
                }
                let resp = self
                    .client
                    .post(format!("{}/api/embed", self.url))
                    .header("Content-Type", "application/json")
                    .json(body)
                    .send()
                    .await;

                let response = match resp {
                    Ok(response) => response,
                    Err(err) => {
                        return Err(Retry::Transient(EmbeddingError::Unavailable(format!(
                            "Ollama connection error (is Ollama running at {}?): {}",
                            self.url, err
                        ))))
                    }
                };

                let status = response.status();
                if !status.is_success() {
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(classify_status(status, body_text));
                }

                let parsed: OllamaEmbeddingResponse = response.json().await.map_err(|err| {
                    Retry::Permanent(EmbeddingError::InvalidResponse(err.to_string()))
                })?;
                Ok(parsed.embeddings)
            }
        })
        .await
    }
}

#[async_trait]
impl EmbeddingClient for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        check_dims(&vectors, self.dims)?;
        Ok(vectors)
    }
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_check_dims_catches_mismatch() {
        let vectors = vec![vec![0.0; 3], vec![0.0; 4]];
        let err = check_dims(&vectors, 3).unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 3,
                actual: 4
            }
        ));
    }

    #[test]
    fn test_classify_status() {
        let transient = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(matches!(
            transient,
            Retry::Transient(EmbeddingError::Unavailable(_))
        ));

        let permanent = classify_status(reqwest::StatusCode::BAD_REQUEST, String::new());
        assert!(matches!(
            permanent,
            Retry::Permanent(EmbeddingError::Rejected(_))
        ));
    }
}
