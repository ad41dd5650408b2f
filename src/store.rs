//! Vector store abstraction.
//!
//! The [`VectorStore`] trait covers the three operations the pipeline
//! needs: upsert a chunk with its vector, query k-nearest by cosine
//! similarity under an exact course filter, and delete by chunk or by
//! document. Implementations must be `Send + Sync` for the async runtime.
//!
//! Query ordering is part of the contract: descending similarity, ties
//! broken by ascending chunk id, at most `k` results, every result in the
//! requested course.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::VectorStoreError;
use crate::models::{Chunk, ScoredChunk};

/// Abstract vector index over (chunk, vector) pairs.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or overwrite a chunk and its embedding. Upserting an existing
    /// chunk id is last-write-wins.
    async fn upsert(&self, chunk: &Chunk, vector: &[f32]) -> Result<(), VectorStoreError>;

    /// Return up to `k` chunks of `course_id` nearest to `vector`, ordered
    /// by descending similarity with ascending-id tie-break.
    async fn query(
        &self,
        vector: &[f32],
        course_id: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, VectorStoreError>;

    /// Remove one chunk. Removing an unknown id is a no-op.
    async fn delete(&self, chunk_id: &str) -> Result<(), VectorStoreError>;

    /// Remove all chunks of a document (used when re-ingesting).
    async fn delete_document(&self, document_id: &str) -> Result<(), VectorStoreError>;
}

/// Sort candidates into the contract order and truncate to `k`.
fn rank(mut candidates: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    candidates.truncate(k);
    candidates
}

// ============ SQLite ============

/// SQLite-backed vector store.
///
/// Chunks live in the `chunks` table, embeddings in `chunk_vectors` as
/// little-endian f32 BLOBs. Similarity is computed in process over the
/// course's vectors; course corpora are small enough that a brute-force
/// scan beats maintaining an approximate index.
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, chunk: &Chunk, vector: &[f32]) -> Result<(), VectorStoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO chunks (id, course_id, document_id, chunk_index, text, token_count, overlap_len, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                course_id = excluded.course_id,
                document_id = excluded.document_id,
                chunk_index = excluded.chunk_index,
                text = excluded.text,
                token_count = excluded.token_count,
                overlap_len = excluded.overlap_len,
                hash = excluded.hash
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.course_id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(chunk.token_count as i64)
        .bind(chunk.overlap_len as i64)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, course_id, document_id, embedding)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                course_id = excluded.course_id,
                document_id = excluded.document_id,
                embedding = excluded.embedding
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.course_id)
        .bind(&chunk.document_id)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        course_id: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, VectorStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.course_id, c.document_id, c.chunk_index, c.text,
                   c.token_count, c.overlap_len, c.hash, cv.embedding
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            WHERE cv.course_id = ?
            "#,
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        let candidates: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = blob_to_vec(&blob);
                let score = cosine_similarity(vector, &stored) as f64;
                let token_count: i64 = row.get("token_count");
                let overlap_len: i64 = row.get("overlap_len");
                ScoredChunk {
                    chunk: Chunk {
                        id: row.get("id"),
                        course_id: row.get("course_id"),
                        document_id: row.get("document_id"),
                        chunk_index: row.get("chunk_index"),
                        text: row.get("text"),
                        token_count: token_count as usize,
                        overlap_len: overlap_len as usize,
                        hash: row.get("hash"),
                    },
                    score,
                }
            })
            .collect();

        Ok(rank(candidates, k))
    }

    async fn delete(&self, chunk_id: &str) -> Result<(), VectorStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), VectorStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

// ============ In-memory ============

/// In-memory store for tests.
///
/// Brute-force cosine similarity over a `HashMap` behind an `RwLock`.
pub struct MemoryVectorStore {
    entries: RwLock<HashMap<String, (Chunk, Vec<f32>)>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, chunk: &Chunk, vector: &[f32]) -> Result<(), VectorStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| VectorStoreError::Connection(e.to_string()))?;
        entries.insert(chunk.id.clone(), (chunk.clone(), vector.to_vec()));
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        course_id: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, VectorStoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| VectorStoreError::Connection(e.to_string()))?;
        let candidates: Vec<ScoredChunk> = entries
            .values()
            .filter(|(chunk, _)| chunk.course_id == course_id)
            .map(|(chunk, stored)| ScoredChunk {
                chunk: chunk.clone(),
                score: cosine_similarity(vector, stored) as f64,
            })
            .collect();
        Ok(rank(candidates, k))
    }

    async fn delete(&self, chunk_id: &str) -> Result<(), VectorStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| VectorStoreError::Connection(e.to_string()))?;
        entries.remove(chunk_id);
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), VectorStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| VectorStoreError::Connection(e.to_string()))?;
        entries.retain(|_, (chunk, _)| chunk.document_id != document_id);
        Ok(())
    }
}
