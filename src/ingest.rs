//! Ingestion pipeline.
//!
//! Walks a directory of extracted course material (format conversion
//! happens upstream), chunks each file, embeds the chunks in batches, and
//! upserts them into the vector store. Re-ingesting a document replaces
//! all of its chunks so stale spans never survive an update.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::chunker::chunk_document;
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::store::VectorStore;

/// Counters reported after a sync.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub documents: u64,
    pub chunks: u64,
    pub skipped: u64,
}

/// Ingest every matching file under `root` into `course_id`.
///
/// Files that fail chunking (empty, oversized) are skipped with a warning;
/// embedding or store failures abort the sync.
pub async fn ingest_directory(
    config: &Config,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    course_id: &str,
    root: &Path,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let extension = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");
        if !config
            .ingest
            .include_extensions
            .iter()
            .any(|allowed| allowed == extension)
        {
            continue;
        }

        // The relative path is the document identifier; stable across
        // re-ingests of the same tree.
        let document_id = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();

        let text = std::fs::read_to_string(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;

        let chunks = match chunk_document(course_id, &document_id, &text, &config.chunking) {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!(document_id = %document_id, %err, "skipping document");
                report.skipped += 1;
                continue;
            }
        };

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder
            .embed(&texts)
            .await
            .with_context(|| format!("Failed to embed {}", document_id))?;

        store
            .delete_document(&document_id)
            .await
            .with_context(|| format!("Failed to clear old chunks for {}", document_id))?;
        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            store
                .upsert(chunk, vector)
                .await
                .with_context(|| format!("Failed to store chunk {}", chunk.id))?;
        }

        info!(document_id = %document_id, chunks = chunks.len(), "document ingested");
        report.documents += 1;
        report.chunks += chunks.len() as u64;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, DbConfig, IngestConfig, ServerConfig};
    use crate::error::EmbeddingError;
    use crate::models::ScoredChunk;
    use crate::store::MemoryVectorStore;
    use async_trait::async_trait;
    use std::io::Write;

    struct HashEmbedder;

    #[async_trait]
    impl EmbeddingClient for HashEmbedder {
        fn model_name(&self) -> &str {
            "hash-test"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let len = t.len() as f32;
                    vec![len, len.sqrt(), 1.0, 0.0]
                })
                .collect())
        }
    }

    fn test_config() -> Config {
        Config {
            db: DbConfig {
                path: "/tmp/unused.db".into(),
            },
            chunking: ChunkingConfig {
                max_tokens: 64,
                overlap_tokens: 8,
                max_document_bytes: 1024 * 1024,
            },
            retrieval: Default::default(),
            embedding: Default::default(),
            generation: Default::default(),
            pipeline: Default::default(),
            server: ServerConfig {
                bind: "127.0.0.1:0".to_string(),
            },
            ingest: IngestConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_ingest_directory_chunks_and_stores() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("notes.md")).unwrap();
        writeln!(file, "B-trees keep keys sorted.\n\nPages split when full.").unwrap();
        // Non-matching extension is ignored.
        std::fs::File::create(dir.path().join("slides.pdf")).unwrap();

        let store = Arc::new(MemoryVectorStore::new());
        let report = ingest_directory(
            &test_config(),
            store.clone(),
            Arc::new(HashEmbedder),
            "db101",
            dir.path(),
        )
        .await
        .unwrap();

        assert_eq!(report.documents, 1);
        assert!(report.chunks >= 1);

        let hits: Vec<ScoredChunk> = store.query(&[10.0, 3.0, 1.0, 0.0], "db101", 10).await.unwrap();
        assert_eq!(hits.len() as u64, report.chunks);
        assert!(hits.iter().all(|h| h.chunk.document_id == "notes.md"));
    }

    #[tokio::test]
    async fn test_reingest_replaces_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "Old body text for the document.").unwrap();

        let store = Arc::new(MemoryVectorStore::new());
        let config = test_config();
        ingest_directory(&config, store.clone(), Arc::new(HashEmbedder), "db101", dir.path())
            .await
            .unwrap();

        std::fs::write(&path, "New body text for the document.").unwrap();
        ingest_directory(&config, store.clone(), Arc::new(HashEmbedder), "db101", dir.path())
            .await
            .unwrap();

        let hits = store.query(&[10.0, 3.0, 1.0, 0.0], "db101", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].chunk.text.starts_with("New body"));
    }

    #[tokio::test]
    async fn test_empty_file_skipped_with_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.md"), "").unwrap();
        std::fs::write(dir.path().join("real.md"), "Some actual content here.").unwrap();

        let store = Arc::new(MemoryVectorStore::new());
        let report = ingest_directory(
            &test_config(),
            store,
            Arc::new(HashEmbedder),
            "db101",
            dir.path(),
        )
        .await
        .unwrap();

        assert_eq!(report.documents, 1);
        assert_eq!(report.skipped, 1);
    }
}
