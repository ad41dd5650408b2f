//! End-to-end pipeline tests against the in-memory store and stub
//! providers.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lectern::config::{PipelineConfig, RetrievalConfig};
use lectern::courses::MemoryEnrollments;
use lectern::embedding::EmbeddingClient;
use lectern::error::{EmbeddingError, GenerationError, PipelineError};
use lectern::generation::{GenerationClient, GenerationRequest};
use lectern::history::MemoryHistory;
use lectern::models::Chunk;
use lectern::pipeline::{QueryPipeline, QueryRequest};
use lectern::retriever::Retriever;
use lectern::store::{MemoryVectorStore, VectorStore};

// ============ Stubs ============

/// Deterministic bag-of-words embedder: shared vocabulary produces high
/// cosine similarity.
struct BagEmbedder {
    calls: AtomicUsize,
}

impl BagEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 16];
        for word in text.to_lowercase().split_whitespace() {
            let idx = word.bytes().map(|b| b as usize).sum::<usize>() % 16;
            v[idx] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingClient for BagEmbedder {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }
    fn dims(&self) -> usize {
        16
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Embedder returning a fixed vector, for tests that pin exact scores.
struct FixedEmbedder(Vec<f32>);

#[async_trait]
impl EmbeddingClient for FixedEmbedder {
    fn model_name(&self) -> &str {
        "fixed"
    }
    fn dims(&self) -> usize {
        self.0.len()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|_| self.0.clone()).collect())
    }
}

/// Generator that records every request and returns a canned answer.
struct RecordingGenerator {
    answer: String,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl RecordingGenerator {
    fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationClient for RecordingGenerator {
    fn model_name(&self) -> &str {
        "recording"
    }
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.answer.clone())
    }
}

/// Generator whose provider is permanently down.
struct DownGenerator;

#[async_trait]
impl GenerationClient for DownGenerator {
    fn model_name(&self) -> &str {
        "down"
    }
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
        Err(GenerationError::ProviderUnavailable(
            "three consecutive timeouts".to_string(),
        ))
    }
}

/// Generator that never completes within any reasonable budget.
struct HangingGenerator;

#[async_trait]
impl GenerationClient for HangingGenerator {
    fn model_name(&self) -> &str {
        "hanging"
    }
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(String::new())
    }
}

// ============ Fixture ============

fn chunk(id: &str, course: &str, doc: &str, text: &str) -> Chunk {
    Chunk {
        id: id.to_string(),
        course_id: course.to_string(),
        document_id: doc.to_string(),
        chunk_index: 0,
        text: text.to_string(),
        token_count: lectern::chunker::estimate_tokens(text),
        overlap_len: 0,
        hash: String::new(),
    }
}

struct Fixture {
    store: Arc<MemoryVectorStore>,
    history: Arc<MemoryHistory>,
    enrollments: Arc<MemoryEnrollments>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryVectorStore::new()),
            history: Arc::new(MemoryHistory::new()),
            enrollments: Arc::new(MemoryEnrollments::new()),
        }
    }

    async fn seed_course_material(&self) {
        self.enrollments.enroll("alice", "db101");
        for (id, text) in [
            ("chunk-btree", "a b-tree keeps keys sorted inside balanced pages"),
            ("chunk-hash", "hash indexes map keys into fixed buckets"),
            ("chunk-wal", "the write ahead log orders durable updates"),
        ] {
            self.store
                .upsert(&chunk(id, "db101", "notes.md", text), &BagEmbedder::vector(text))
                .await
                .unwrap();
        }
    }

    fn pipeline(
        &self,
        embedder: Arc<dyn EmbeddingClient>,
        generator: Arc<dyn GenerationClient>,
        config: PipelineConfig,
        retrieval: RetrievalConfig,
    ) -> QueryPipeline {
        let top_k = retrieval.top_k;
        QueryPipeline::new(
            Retriever::new(embedder, self.store.clone(), retrieval),
            generator,
            self.history.clone(),
            self.enrollments.clone(),
            config,
            top_k,
            None,
        )
    }
}

fn request(question: &str, course: &str, user: &str, conversation: Option<&str>) -> QueryRequest {
    QueryRequest {
        user_id: user.to_string(),
        course_id: course.to_string(),
        question: question.to_string(),
        conversation_id: conversation.map(str::to_string),
    }
}

fn lenient_retrieval() -> RetrievalConfig {
    RetrievalConfig {
        top_k: 3,
        min_similarity: 0.05,
        near_tie_margin: 0.02,
    }
}

// ============ Tests ============

#[tokio::test]
async fn test_successful_query_persists_record_with_citations() {
    let fixture = Fixture::new();
    fixture.seed_course_material().await;

    let generator = Arc::new(RecordingGenerator::new("B-trees keep keys sorted."));
    let pipeline = fixture.pipeline(
        Arc::new(BagEmbedder::new()),
        generator.clone(),
        PipelineConfig::default(),
        lenient_retrieval(),
    );

    let response = pipeline
        .run(request(
            "how does a b-tree keep keys sorted",
            "db101",
            "alice",
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.answer, "B-trees keep keys sorted.");
    assert!(!response.citations.is_empty());
    assert!(!response.conversation_id.is_empty());

    let records = fixture.history.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].citations, response.citations);
    assert_eq!(records[0].conversation_id, response.conversation_id);
    assert_eq!(records[0].user_id, "alice");

    // The generator saw the retrieved material.
    let seen = generator.requests();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].context.contains("b-tree"));
}

#[tokio::test]
async fn test_unenrolled_user_rejected_before_retrieval() {
    let fixture = Fixture::new();
    fixture.seed_course_material().await;

    let embedder = Arc::new(BagEmbedder::new());
    let pipeline = fixture.pipeline(
        embedder.clone(),
        Arc::new(RecordingGenerator::new("unused")),
        PipelineConfig::default(),
        lenient_retrieval(),
    );

    let err = pipeline
        .run(request("what is a b-tree", "cs200", "alice", None))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ForbiddenScope { .. }));
    assert_eq!(err.code(), "forbidden_scope");
    // No retrieval call was issued.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    assert!(fixture.history.records().is_empty());
}

#[tokio::test]
async fn test_provider_unavailable_persists_nothing() {
    let fixture = Fixture::new();
    fixture.seed_course_material().await;

    let pipeline = fixture.pipeline(
        Arc::new(BagEmbedder::new()),
        Arc::new(DownGenerator),
        PipelineConfig::default(),
        lenient_retrieval(),
    );

    let err = pipeline
        .run(request("what is a b-tree", "db101", "alice", None))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Generation(GenerationError::ProviderUnavailable(_))
    ));
    assert!(fixture.history.records().is_empty());
}

#[tokio::test]
async fn test_no_usable_context_when_nothing_clears_floor() {
    let fixture = Fixture::new();
    fixture.seed_course_material().await;

    let retrieval = RetrievalConfig {
        top_k: 3,
        min_similarity: 0.999,
        near_tie_margin: 0.02,
    };
    let pipeline = fixture.pipeline(
        Arc::new(BagEmbedder::new()),
        Arc::new(RecordingGenerator::new("unused")),
        PipelineConfig::default(),
        retrieval,
    );

    let err = pipeline
        .run(request("completely unrelated topic", "db101", "alice", None))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::NoUsableContext));
    assert!(fixture.history.records().is_empty());
}

#[tokio::test]
async fn test_ungrounded_answers_allowed_when_configured() {
    let fixture = Fixture::new();
    fixture.enrollments.enroll("alice", "db101");

    let generator = Arc::new(RecordingGenerator::new("General knowledge answer."));
    let pipeline = fixture.pipeline(
        Arc::new(BagEmbedder::new()),
        generator.clone(),
        PipelineConfig {
            allow_ungrounded: true,
            ..Default::default()
        },
        lenient_retrieval(),
    );

    let response = pipeline
        .run(request("what is a b-tree", "db101", "alice", None))
        .await
        .unwrap();

    assert!(response.citations.is_empty());
    assert!(generator.requests()[0].context.is_empty());
    assert_eq!(fixture.history.records().len(), 1);
}

#[tokio::test]
async fn test_exact_scores_filtered_by_threshold_in_order() {
    // Candidate similarities 0.91, 0.87, 0.40 against floor 0.5: exactly
    // the first two survive, in score order.
    let fixture = Fixture::new();
    fixture.enrollments.enroll("alice", "db101");

    for (id, cos) in [("chunk-a", 0.91f32), ("chunk-b", 0.87), ("chunk-c", 0.40)] {
        let vector = vec![cos, (1.0 - cos * cos).sqrt()];
        fixture
            .store
            .upsert(&chunk(id, "db101", "notes.md", id), &vector)
            .await
            .unwrap();
    }

    let retriever = Retriever::new(
        Arc::new(FixedEmbedder(vec![1.0, 0.0])),
        fixture.store.clone(),
        RetrievalConfig {
            top_k: 3,
            min_similarity: 0.5,
            near_tie_margin: 0.02,
        },
    );

    let hits = retriever.retrieve("what is a b-tree", "db101", 3).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
    assert_eq!(ids, vec!["chunk-a", "chunk-b"]);
    assert!(hits[0].score > hits[1].score);
}

#[tokio::test]
async fn test_second_turn_context_excludes_first_answer_by_default() {
    let fixture = Fixture::new();
    fixture.seed_course_material().await;

    let marker = "FIRST_TURN_ANSWER_MARKER";
    let generator = Arc::new(RecordingGenerator::new(marker));
    let pipeline = fixture.pipeline(
        Arc::new(BagEmbedder::new()),
        generator.clone(),
        PipelineConfig::default(),
        lenient_retrieval(),
    );

    let first = pipeline
        .run(request("what is a b-tree", "db101", "alice", None))
        .await
        .unwrap();
    pipeline
        .run(request(
            "how do its pages split",
            "db101",
            "alice",
            Some(&first.conversation_id),
        ))
        .await
        .unwrap();

    let seen = generator.requests();
    assert_eq!(seen.len(), 2);
    assert!(!seen[1].context.contains(marker));
    assert!(seen[1].history.is_empty());
}

#[tokio::test]
async fn test_history_injection_carries_prior_turn_when_enabled() {
    let fixture = Fixture::new();
    fixture.seed_course_material().await;

    let marker = "FIRST_TURN_ANSWER_MARKER";
    let generator = Arc::new(RecordingGenerator::new(marker));
    let pipeline = fixture.pipeline(
        Arc::new(BagEmbedder::new()),
        generator.clone(),
        PipelineConfig {
            include_history: true,
            ..Default::default()
        },
        lenient_retrieval(),
    );

    let first = pipeline
        .run(request("what is a b-tree", "db101", "alice", None))
        .await
        .unwrap();
    pipeline
        .run(request(
            "how do its pages split",
            "db101",
            "alice",
            Some(&first.conversation_id),
        ))
        .await
        .unwrap();

    let seen = generator.requests();
    assert_eq!(seen.len(), 2);
    // Prior answer arrives via history turns, still not via context.
    assert!(!seen[1].context.contains(marker));
    assert_eq!(seen[1].history.len(), 1);
    assert_eq!(seen[1].history[0].answer, marker);
    assert_eq!(seen[1].history[0].question, "what is a b-tree");
}

#[tokio::test]
async fn test_wall_clock_budget_enforced() {
    let fixture = Fixture::new();
    fixture.seed_course_material().await;

    let pipeline = fixture.pipeline(
        Arc::new(BagEmbedder::new()),
        Arc::new(HangingGenerator),
        PipelineConfig {
            budget_secs: 1,
            ..Default::default()
        },
        lenient_retrieval(),
    );

    let err = pipeline
        .run(request("what is a b-tree", "db101", "alice", None))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::TimeoutExceeded { budget_secs: 1 }
    ));
    assert!(fixture.history.records().is_empty());
}

#[tokio::test]
async fn test_conversation_records_persist_in_completion_order() {
    let fixture = Fixture::new();
    fixture.seed_course_material().await;

    let pipeline = fixture.pipeline(
        Arc::new(BagEmbedder::new()),
        Arc::new(RecordingGenerator::new("answer")),
        PipelineConfig::default(),
        lenient_retrieval(),
    );

    let first = pipeline
        .run(request("what is a b-tree", "db101", "alice", None))
        .await
        .unwrap();
    let second = pipeline
        .run(request(
            "and hash indexes",
            "db101",
            "alice",
            Some(&first.conversation_id),
        ))
        .await
        .unwrap();

    assert_eq!(first.conversation_id, second.conversation_id);
    let records = fixture.history.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, first.query_id);
    assert_eq!(records[1].id, second.query_id);
}
