//! Course-scoped retrieval.
//!
//! Composes the embedding client and the vector store: embed the question,
//! run a filtered nearest-neighbour query, drop results below the
//! similarity floor, and stabilize near-ties with a lexical overlap
//! signal. Embedding scores for close candidates jitter across model
//! versions; the lexical re-rank keeps the output order stable under that
//! noise.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingClient;
use crate::error::{EmbeddingError, PipelineError};
use crate::models::ScoredChunk;
use crate::store::VectorStore;

pub struct Retriever {
    embedder: Arc<dyn EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    /// Retrieve up to `k` chunks of `course_id` relevant to `question`.
    ///
    /// An empty result is not an error: it means nothing scored above the
    /// configured similarity floor.
    pub async fn retrieve(
        &self,
        question: &str,
        course_id: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        let vectors = self.embedder.embed(&[question.to_string()]).await?;
        let query_vec = vectors.into_iter().next().ok_or_else(|| {
            EmbeddingError::InvalidResponse("empty embedding response".to_string())
        })?;

        let mut hits = self.store.query(&query_vec, course_id, k).await?;
        let fetched = hits.len();
        hits.retain(|hit| hit.score >= self.config.min_similarity);
        debug!(
            course_id,
            fetched,
            kept = hits.len(),
            floor = self.config.min_similarity,
            "retrieval candidates"
        );

        rerank_near_ties(&mut hits, question, self.config.near_tie_margin);
        Ok(hits)
    }
}

/// Re-rank runs of near-tied results by lexical overlap with the question.
///
/// Results are grouped greedily: a result joins the current group while its
/// score is within `margin` of the group head. Inside a group, ordering is
/// lexical overlap desc, then score desc, then chunk id asc.
fn rerank_near_ties(hits: &mut [ScoredChunk], question: &str, margin: f64) {
    if hits.len() < 2 || margin <= 0.0 {
        return;
    }

    let question_terms: HashSet<String> = terms(question);
    let overlaps: HashMap<String, f64> = hits
        .iter()
        .map(|hit| {
            (
                hit.chunk.id.clone(),
                lexical_overlap(&question_terms, &hit.chunk.text),
            )
        })
        .collect();

    let mut start = 0;
    while start < hits.len() {
        let head_score = hits[start].score;
        let mut end = start + 1;
        while end < hits.len() && head_score - hits[end].score <= margin {
            end += 1;
        }
        if end - start > 1 {
            hits[start..end].sort_by(|a, b| {
                let oa = overlaps.get(&a.chunk.id).copied().unwrap_or(0.0);
                let ob = overlaps.get(&b.chunk.id).copied().unwrap_or(0.0);
                ob.partial_cmp(&oa)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        b.score
                            .partial_cmp(&a.score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.chunk.id.cmp(&b.chunk.id))
            });
        }
        start = end;
    }
}

/// Fraction of the question's terms that appear in `text`.
fn lexical_overlap(question_terms: &HashSet<String>, text: &str) -> f64 {
    if question_terms.is_empty() {
        return 0.0;
    }
    let text_terms = terms(text);
    let shared = question_terms
        .iter()
        .filter(|term| text_terms.contains(*term))
        .count();
    shared as f64 / question_terms.len() as f64
}

fn terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn scored(id: &str, text: &str, score: f64) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: id.to_string(),
                course_id: "db101".to_string(),
                document_id: "a.md".to_string(),
                chunk_index: 0,
                text: text.to_string(),
                token_count: 1,
                overlap_len: 0,
                hash: String::new(),
            },
            score,
        }
    }

    #[test]
    fn test_distinct_scores_keep_their_order() {
        let mut hits = vec![
            scored("c1", "a b-tree is a balanced search tree", 0.91),
            scored("c2", "hash indexes map keys to buckets", 0.87),
        ];
        rerank_near_ties(&mut hits, "what is a b-tree?", 0.02);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_near_ties_reordered_by_lexical_overlap() {
        let mut hits = vec![
            scored("c1", "hash indexes map keys to buckets", 0.90),
            scored("c2", "a b-tree is a balanced search tree", 0.89),
            scored("c3", "transactions and locking", 0.40),
        ];
        rerank_near_ties(&mut hits, "what is a b tree", 0.02);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        // c2 shares more question terms, so it wins the near-tie; c3 is far
        // below and keeps its place.
        assert_eq!(ids, vec!["c2", "c1", "c3"]);
    }

    #[test]
    fn test_tie_on_overlap_falls_back_to_score_then_id() {
        let mut hits = vec![
            scored("c2", "unrelated text", 0.900),
            scored("c1", "unrelated text", 0.900),
        ];
        rerank_near_ties(&mut hits, "what is a b tree", 0.02);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_zero_margin_is_a_no_op() {
        let mut hits = vec![
            scored("c1", "hash indexes", 0.90),
            scored("c2", "b-tree pages", 0.90),
        ];
        rerank_near_ties(&mut hits, "b-tree", 0.0);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_lexical_overlap_fraction() {
        let question = terms("what is a b tree");
        assert!(lexical_overlap(&question, "a b tree is balanced") > 0.9);
        assert_eq!(lexical_overlap(&question, "xyzzy"), 0.0);
    }
}
