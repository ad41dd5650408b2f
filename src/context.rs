//! Token-budgeted context assembly.
//!
//! Takes the retriever's ranked chunks and produces the prompt context:
//! chunks are included greedily in rank order while the running token
//! total stays within budget, and chunks that near-duplicate an already
//! included chunk are skipped so the budget is not wasted on repeats.
//! Overlapping ingestion windows make such repeats common.

use std::collections::HashSet;

use crate::chunker::estimate_tokens;
use crate::models::ScoredChunk;

/// The assembled prompt context plus the citations backing it.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    /// Formatted context text, one numbered section per included chunk.
    pub text: String,
    /// Ids of the included chunks, in inclusion order.
    pub citations: Vec<String>,
    /// Token estimate of `text`.
    pub token_count: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }
}

/// Greedily assemble a context from ranked chunks.
///
/// Deterministic for identical inputs and thresholds. The produced text's
/// token estimate never exceeds `max_tokens`.
pub fn assemble(
    ranked: &[ScoredChunk],
    max_tokens: usize,
    dedup_threshold: f64,
) -> AssembledContext {
    let mut context = AssembledContext::default();
    let mut included: Vec<&str> = Vec::new();

    for hit in ranked {
        let text = hit.chunk.text.as_str();

        if included
            .iter()
            .any(|prev| is_near_duplicate(prev, text, dedup_threshold))
        {
            continue;
        }

        let section = format!("[{}] {}\n\n", context.citations.len() + 1, text);
        let section_tokens = estimate_tokens(&section);
        if context.token_count + section_tokens > max_tokens {
            // Ranked order is relevance order: once a chunk does not fit,
            // stop rather than backfill with weaker material.
            break;
        }

        context.text.push_str(&section);
        context.token_count += section_tokens;
        context.citations.push(hit.chunk.id.clone());
        included.push(text);
    }

    context
}

/// True when `candidate` repeats `existing`: one contains the other, or
/// their word sets are more similar than `threshold` (Jaccard).
fn is_near_duplicate(existing: &str, candidate: &str, threshold: f64) -> bool {
    if existing.contains(candidate) || candidate.contains(existing) {
        return true;
    }
    if threshold > 1.0 {
        return false;
    }

    let a: HashSet<&str> = existing.split_whitespace().collect();
    let b: HashSet<&str> = candidate.split_whitespace().collect();
    if a.is_empty() || b.is_empty() {
        return false;
    }

    let shared = a.intersection(&b).count();
    let union = a.len() + b.len() - shared;
    shared as f64 / union as f64 >= threshold
}
