//! Query orchestration.
//!
//! Drives one query through scope validation, retrieval, context assembly,
//! generation, and persistence, under a single wall-clock budget. Failure
//! at any step persists nothing; the typed error reaches the boundary
//! unchanged. Within a conversation, records are appended in the order
//! their generation completed.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, PipelineConfig};
use crate::context::assemble;
use crate::courses::{EnrollmentStore, SqliteEnrollments};
use crate::embedding::create_embedder;
use crate::error::PipelineError;
use crate::generation::{
    create_generator, GenerationClient, GenerationRequest, DEFAULT_SYSTEM_PROMPT,
};
use crate::history::{HistoryStore, SqliteHistory};
use crate::models::QueryRecord;
use crate::retriever::Retriever;
use crate::store::SqliteVectorStore;

/// One incoming query, with the identity already established upstream.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub user_id: String,
    pub course_id: String,
    pub question: String,
    /// Groups related turns; a fresh id is generated when absent.
    pub conversation_id: Option<String>,
}

/// The answer returned to the caller on success.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub query_id: String,
    pub answer: String,
    /// Chunk ids that grounded the answer, in context order.
    pub citations: Vec<String>,
    pub conversation_id: String,
}

/// Top-level coordinator for the retrieval-augmented query flow.
pub struct QueryPipeline {
    retriever: Retriever,
    generator: Arc<dyn GenerationClient>,
    history: Arc<dyn HistoryStore>,
    enrollments: Arc<dyn EnrollmentStore>,
    config: PipelineConfig,
    top_k: usize,
    system_prompt: String,
}

impl QueryPipeline {
    pub fn new(
        retriever: Retriever,
        generator: Arc<dyn GenerationClient>,
        history: Arc<dyn HistoryStore>,
        enrollments: Arc<dyn EnrollmentStore>,
        config: PipelineConfig,
        top_k: usize,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            retriever,
            generator,
            history,
            enrollments,
            config,
            top_k,
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }

    /// Run one query under the configured wall-clock budget.
    ///
    /// Dropping the returned future (client disconnect) cancels any
    /// in-flight provider call; partial work is discarded, never persisted.
    pub async fn run(&self, request: QueryRequest) -> Result<QueryResponse, PipelineError> {
        let budget_secs = self.config.budget_secs;
        match tokio::time::timeout(Duration::from_secs(budget_secs), self.run_inner(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::TimeoutExceeded { budget_secs }),
        }
    }

    async fn run_inner(&self, request: QueryRequest) -> Result<QueryResponse, PipelineError> {
        // Scope first: an unenrolled user never triggers retrieval.
        if !self
            .enrollments
            .is_enrolled(&request.user_id, &request.course_id)
            .await?
        {
            warn!(
                user_id = %request.user_id,
                course_id = %request.course_id,
                "query rejected: not enrolled"
            );
            return Err(PipelineError::ForbiddenScope {
                user_id: request.user_id,
                course_id: request.course_id,
            });
        }

        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let ranked = self
            .retriever
            .retrieve(&request.question, &request.course_id, self.top_k)
            .await?;

        if ranked.is_empty() && !self.config.allow_ungrounded {
            info!(course_id = %request.course_id, "no chunk above similarity floor");
            return Err(PipelineError::NoUsableContext);
        }

        let context = assemble(
            &ranked,
            self.config.context_max_tokens,
            self.config.dedup_threshold,
        );
        debug!(
            citations = context.citations.len(),
            tokens = context.token_count,
            "context assembled"
        );

        // Prior answers reach the prompt only through explicit history
        // injection, never through the retrieval context.
        let history = if self.config.include_history {
            self.history
                .recent_turns(&request.user_id, &conversation_id, self.config.history_turns)
                .await?
        } else {
            Vec::new()
        };

        let answer = self
            .generator
            .generate(&GenerationRequest {
                system: self.system_prompt.clone(),
                context: context.text,
                question: request.question.clone(),
                history,
            })
            .await?;

        let record = QueryRecord {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            course_id: request.course_id,
            question: request.question,
            answer,
            citations: context.citations,
            conversation_id,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.history.append(&record).await?;
        info!(query_id = %record.id, conversation_id = %record.conversation_id, "query completed");

        Ok(QueryResponse {
            query_id: record.id,
            answer: record.answer,
            citations: record.citations,
            conversation_id: record.conversation_id,
        })
    }
}

/// Shared application state: the pipeline plus the history store the
/// boundary surfaces directly.
pub struct App {
    pub pipeline: QueryPipeline,
    pub history: Arc<dyn HistoryStore>,
}

/// Wire up the pipeline from configuration and a connected pool.
///
/// Providers are created once here and shared; components receive them
/// explicitly so tests can substitute implementations.
pub fn build_app(config: &Config, pool: sqlx::SqlitePool) -> anyhow::Result<App> {
    let embedder = create_embedder(&config.embedding)?;
    let generator = create_generator(&config.generation)?;
    let store = Arc::new(SqliteVectorStore::new(pool.clone()));
    let history: Arc<dyn HistoryStore> = Arc::new(SqliteHistory::new(pool.clone()));
    let enrollments = Arc::new(SqliteEnrollments::new(pool));

    let retriever = Retriever::new(embedder, store, config.retrieval.clone());
    let pipeline = QueryPipeline::new(
        retriever,
        generator,
        history.clone(),
        enrollments,
        config.pipeline.clone(),
        config.retrieval.top_k,
        config.generation.system_prompt.clone(),
    );

    Ok(App { pipeline, history })
}
