//! Boundary-aware document chunker.
//!
//! Splits extracted course-material text into [`Chunk`]s that respect a
//! configurable `max_tokens` limit. Splitting prefers paragraph boundaries
//! (`\n\n`), falls back to sentence boundaries for oversized paragraphs,
//! and hard-splits at fixed windows as a last resort. Each chunk after the
//! first carries up to `overlap_tokens` of trailing text from its
//! predecessor so that retrieval does not lose context at cut points.
//!
//! Invariants:
//! - every byte of the input is covered by exactly one chunk body, so
//!   concatenating chunk texts with their leading overlaps stripped
//!   reconstructs the input;
//! - no chunk's token estimate exceeds `max_tokens`;
//! - a chunk's overlap never exceeds `overlap_tokens`.

use sha2::{Digest, Sha256};
use std::ops::Range;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::error::ChunkingError;
use crate::models::Chunk;

/// Approximate chars-per-token ratio used for all token estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a text span, rounding up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Split a document into chunks covering the whole input.
///
/// Chunk indices are contiguous starting at 0. Chunk ids are fresh UUIDs;
/// everything else about the output is deterministic for identical input
/// and configuration.
pub fn chunk_document(
    course_id: &str,
    document_id: &str,
    text: &str,
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>, ChunkingError> {
    if text.trim().is_empty() {
        return Err(ChunkingError::EmptyDocument);
    }
    if text.len() > config.max_document_bytes {
        return Err(ChunkingError::DocumentTooLarge {
            size: text.len(),
            max: config.max_document_bytes,
        });
    }

    // The body budget leaves room for the prepended overlap, keeping the
    // whole chunk (overlap + body) within max_tokens.
    let overlap_budget = config.overlap_tokens * CHARS_PER_TOKEN;
    let body_budget = (config.max_tokens - config.overlap_tokens) * CHARS_PER_TOKEN;

    let spans = split_spans(text, body_budget);

    let mut chunks = Vec::with_capacity(spans.len());
    for (index, span) in spans.iter().enumerate() {
        let overlap_start = if index == 0 || overlap_budget == 0 {
            span.start
        } else {
            let mut start = span.start.saturating_sub(overlap_budget);
            while !text.is_char_boundary(start) {
                start += 1;
            }
            start
        };

        let chunk_text = &text[overlap_start..span.end];
        chunks.push(make_chunk(
            course_id,
            document_id,
            index as i64,
            chunk_text,
            span.start - overlap_start,
        ));
    }

    Ok(chunks)
}

/// Produce contiguous byte ranges covering all of `text`, each at most
/// `budget` bytes, cutting on paragraph boundaries where possible.
fn split_spans(text: &str, budget: usize) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut cur_start = 0usize;
    let mut cur_end = 0usize;

    for para in paragraph_spans(text) {
        let para_len = para.end - para.start;

        if para_len > budget {
            if cur_end > cur_start {
                spans.push(cur_start..cur_end);
            }
            split_oversized(text, para.clone(), budget, &mut spans);
            cur_start = para.end;
            cur_end = para.end;
        } else if para.end - cur_start > budget && cur_end > cur_start {
            spans.push(cur_start..cur_end);
            cur_start = para.start;
            cur_end = para.end;
        } else {
            cur_end = para.end;
        }
    }

    if cur_end > cur_start {
        spans.push(cur_start..cur_end);
    }

    spans
}

/// Byte ranges of paragraphs, each including its trailing blank-line
/// separator so the ranges tile the input with no gaps.
fn paragraph_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut offset = 0usize;
    for part in text.split_inclusive("\n\n") {
        spans.push(offset..offset + part.len());
        offset += part.len();
    }
    if offset < text.len() {
        spans.push(offset..text.len());
    }
    spans
}

/// Split a paragraph that exceeds the budget: first on sentence ends, then
/// at fixed windows for any single sentence still over budget.
fn split_oversized(text: &str, span: Range<usize>, budget: usize, out: &mut Vec<Range<usize>>) {
    let slice = &text[span.clone()];

    let mut cuts: Vec<usize> = slice
        .char_indices()
        .filter(|(_, ch)| matches!(ch, '.' | '!' | '?' | '\n'))
        .map(|(idx, ch)| idx + ch.len_utf8())
        .collect();
    if cuts.last() != Some(&slice.len()) {
        cuts.push(slice.len());
    }

    let mut start = 0usize;
    let mut prev = 0usize;
    for &cut in &cuts {
        if cut - start > budget {
            if prev > start {
                out.push(span.start + start..span.start + prev);
                start = prev;
            }
            // A single sentence longer than the budget: hard windows on
            // char boundaries.
            while cut - start > budget {
                let mut end = start + budget;
                while !slice.is_char_boundary(end) {
                    end -= 1;
                }
                out.push(span.start + start..span.start + end);
                start = end;
            }
        }
        prev = cut;
    }
    if prev > start {
        out.push(span.start + start..span.start + prev);
    }
}

fn make_chunk(
    course_id: &str,
    document_id: &str,
    index: i64,
    text: &str,
    overlap_len: usize,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        course_id: course_id.to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        token_count: estimate_tokens(text),
        overlap_len,
        hash,
    }
}
