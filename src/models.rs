//! Core data types flowing through the ingestion and query pipeline.

use serde::{Deserialize, Serialize};

/// A bounded-size span of course-material text used as a retrieval unit.
///
/// Created at ingestion time and immutable afterwards; replaced wholesale
/// when the source document is re-ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub course_id: String,
    /// Source document identifier (relative path of the ingested file).
    pub document_id: String,
    pub chunk_index: i64,
    /// Chunk text, including any leading overlap from the previous chunk.
    pub text: String,
    pub token_count: usize,
    /// Number of leading bytes of `text` shared with the previous chunk.
    pub overlap_len: usize,
    /// SHA-256 of `text`, used for staleness detection on re-ingest.
    pub hash: String,
}

/// A chunk paired with its retrieval similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// One persisted question/answer turn.
///
/// Immutable once written; deleted individually at the owner's request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: String,
    pub user_id: String,
    pub course_id: String,
    pub question: String,
    pub answer: String,
    /// Chunk ids that grounded the answer, in context-inclusion order.
    pub citations: Vec<String>,
    pub conversation_id: String,
    pub created_at: i64,
}

/// A prior question/answer pair injected into later prompts of the same
/// conversation when history injection is enabled.
#[derive(Debug, Clone)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

/// A course together with the set of users allowed to query it.
#[derive(Debug, Clone)]
pub struct CourseScope {
    pub course_id: String,
    pub user_ids: Vec<String>,
}
