//! Typed errors for the query pipeline.
//!
//! Each component owns a small error enum; [`PipelineError`] unifies them at
//! the orchestrator boundary. Components retry transient provider faults
//! internally — an error that reaches the orchestrator has already exhausted
//! its retry budget and is surfaced unchanged.
//!
//! [`PipelineError::code`] gives the stable external error code used by the
//! HTTP layer, so adding a variant here is the only change needed to extend
//! the error contract.

use thiserror::Error;

/// Errors produced while splitting a document into chunks.
#[derive(Error, Debug)]
pub enum ChunkingError {
    /// Input text was empty or all whitespace.
    #[error("document is empty")]
    EmptyDocument,

    /// Input text exceeds the configured maximum document size.
    #[error("document is {size} bytes, exceeding the {max} byte limit")]
    DocumentTooLarge { size: usize, max: usize },
}

/// Errors produced by an embedding provider.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// The provider rejected the request permanently (invalid input, bad
    /// credentials). Not retried.
    #[error("embedding request rejected: {0}")]
    Rejected(String),

    /// The provider could not be reached, or kept failing transiently until
    /// the retry budget ran out.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    /// A returned vector did not match the configured dimensionality.
    #[error("embedding dimensionality mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The provider returned a response we could not parse.
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

/// Errors produced by the vector store backend.
#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("vector store unavailable: {0}")]
    Connection(String),

    /// Stored data did not match the expected shape (wrong blob length,
    /// missing column).
    #[error("vector store schema mismatch: {0}")]
    Schema(String),
}

impl From<sqlx::Error> for VectorStoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnNotFound(col) => {
                VectorStoreError::Schema(format!("missing column: {col}"))
            }
            other => VectorStoreError::Connection(other.to_string()),
        }
    }
}

/// Errors produced by a generation provider.
#[derive(Error, Debug)]
pub enum GenerationError {
    /// The provider could not be reached, timed out, or kept failing
    /// transiently until the retry budget ran out.
    #[error("generation provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider refused the request on content-policy grounds. Never
    /// retried.
    #[error("generation rejected by content policy: {0}")]
    ContentPolicyRejected(String),
}

/// Unified error surfaced by the query orchestrator.
///
/// Component errors convert in via `From`; the remaining variants belong to
/// the orchestrator itself (scope, budget, persistence).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Chunking(#[from] ChunkingError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// The requesting user is not enrolled in the queried course. Raised
    /// before any retrieval work happens.
    #[error("user {user_id} is not enrolled in course {course_id}")]
    ForbiddenScope { user_id: String, course_id: String },

    /// The whole pipeline exceeded its wall-clock budget.
    #[error("query exceeded the {budget_secs}s pipeline budget")]
    TimeoutExceeded { budget_secs: u64 },

    /// Retrieval produced no chunk above the similarity floor and the
    /// configuration disallows ungrounded answers.
    #[error("no course material matched the question")]
    NoUsableContext,

    /// Reading or writing query history failed.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// A history record was not found (or is not owned by the caller).
    #[error("query record not found: {0}")]
    RecordNotFound(String),
}

impl PipelineError {
    /// Wrap a storage error from the history/enrollment tables.
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        PipelineError::Persistence(err.to_string())
    }

    /// Stable external error code for this error, used in HTTP responses
    /// and logs. Codes are part of the API contract and must not change.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Chunking(_) => "chunking_error",
            PipelineError::Embedding(_) => "embedding_error",
            PipelineError::VectorStore(_) => "vector_store_error",
            PipelineError::Generation(GenerationError::ProviderUnavailable(_)) => {
                "provider_unavailable"
            }
            PipelineError::Generation(GenerationError::ContentPolicyRejected(_)) => {
                "content_policy_rejected"
            }
            PipelineError::ForbiddenScope { .. } => "forbidden_scope",
            PipelineError::TimeoutExceeded { .. } => "timeout_exceeded",
            PipelineError::NoUsableContext => "no_usable_context",
            PipelineError::Persistence(_) => "persistence_error",
            PipelineError::RecordNotFound(_) => "not_found",
        }
    }
}
