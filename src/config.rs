use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_chunk_tokens(),
            overlap_tokens: default_overlap(),
            max_document_bytes: default_max_document_bytes(),
        }
    }
}

fn default_chunk_tokens() -> usize {
    480
}
fn default_overlap() -> usize {
    60
}
fn default_max_document_bytes() -> usize {
    2 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Results scoring below this cosine similarity are dropped.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    /// Results whose scores sit within this margin of each other are
    /// re-ranked by lexical overlap with the question.
    #[serde(default = "default_near_tie_margin")]
    pub near_tie_margin: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            near_tie_margin: default_near_tie_margin(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_similarity() -> f64 {
    0.25
}
fn default_near_tie_margin() -> f64 {
    0.02
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Token budget for the generated answer, not the context.
    #[serde(default = "default_answer_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_gen_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_gen_timeout_secs")]
    pub timeout_secs: u64,
    /// Overrides the built-in system prompt when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            max_tokens: default_answer_tokens(),
            temperature: default_temperature(),
            max_retries: default_gen_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_gen_timeout_secs(),
            system_prompt: None,
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_answer_tokens() -> usize {
    1024
}
fn default_temperature() -> f64 {
    0.3
}
fn default_gen_retries() -> u32 {
    2
}
fn default_gen_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Token budget for the assembled retrieval context.
    #[serde(default = "default_context_tokens")]
    pub context_max_tokens: usize,
    /// Chunks at least this similar to an already-included chunk are
    /// dropped during context assembly.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
    /// Answer even when retrieval finds nothing above the similarity floor.
    #[serde(default)]
    pub allow_ungrounded: bool,
    /// Inject prior turns of the conversation into the generation prompt.
    #[serde(default)]
    pub include_history: bool,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Wall-clock budget for one whole query, across all provider calls.
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            context_max_tokens: default_context_tokens(),
            dedup_threshold: default_dedup_threshold(),
            allow_ungrounded: false,
            include_history: false,
            history_turns: default_history_turns(),
            budget_secs: default_budget_secs(),
        }
    }
}

fn default_context_tokens() -> usize {
    2000
}
fn default_dedup_threshold() -> f64 {
    0.9
}
fn default_history_turns() -> usize {
    5
}
fn default_budget_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_include_extensions")]
    pub include_extensions: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_extensions: default_include_extensions(),
        }
    }
}

fn default_include_extensions() -> Vec<String> {
    vec!["md".to_string(), "txt".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [0.0, 1.0]");
    }
    if config.retrieval.near_tie_margin < 0.0 {
        anyhow::bail!("retrieval.near_tie_margin must be >= 0.0");
    }

    if !(0.0..=1.0).contains(&config.pipeline.dedup_threshold) {
        anyhow::bail!("pipeline.dedup_threshold must be in [0.0, 1.0]");
    }
    if config.pipeline.budget_secs == 0 {
        anyhow::bail!("pipeline.budget_secs must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.generation.is_enabled() && config.generation.model.is_none() {
        anyhow::bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }

    match config.generation.provider.as_str() {
        "disabled" | "anthropic" | "openai" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, anthropic, or openai.",
            other
        ),
    }

    Ok(())
}
