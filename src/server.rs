//! HTTP boundary for the query pipeline.
//!
//! Exposes query submission and history access as a JSON API. The server
//! trusts the `X-User-Id` header for identity: authentication happens at
//! an upstream gateway, and this service never re-implements it.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/queries` | Submit a question scoped to a course |
//! | `GET`  | `/queries/history` | List the caller's query records |
//! | `GET`  | `/queries/conversations` | List the caller's conversation ids |
//! | `DELETE` | `/queries/history/{id}` | Delete one of the caller's records |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "forbidden_scope", "message": "user alice is not enrolled in course cs200" } }
//! ```
//!
//! Codes come from the pipeline error taxonomy plus `bad_request` and
//! `unauthenticated` for boundary-level failures. Failed queries persist
//! nothing, so a client never observes a partial record.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::error::PipelineError;
use crate::history::HistoryFilter;
use crate::models::QueryRecord;
use crate::pipeline::{App, QueryRequest};

/// Start the HTTP server. Runs until the process is terminated.
pub async fn run_server(config: &Config, app: App) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = Arc::new(app);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/queries", post(handle_query))
        .route("/queries/history", get(handle_history))
        .route("/queries/conversations", get(handle_conversations))
        .route("/queries/history/{id}", delete(handle_delete))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!(bind = %bind_addr, "query server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g. `"forbidden_scope"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// Internal error type that converts into an HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthenticated() -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthenticated".to_string(),
        message: "missing X-User-Id header".to_string(),
    }
}

/// Map a pipeline error onto the HTTP status matching its stable code.
fn map_pipeline_error(err: PipelineError) -> AppError {
    let status = match &err {
        PipelineError::ForbiddenScope { .. } => StatusCode::FORBIDDEN,
        PipelineError::RecordNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::TimeoutExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::Embedding(_) | PipelineError::VectorStore(_) => StatusCode::BAD_GATEWAY,
        PipelineError::Generation(inner) => match inner {
            crate::error::GenerationError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            crate::error::GenerationError::ContentPolicyRejected(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
        },
        PipelineError::NoUsableContext | PipelineError::Chunking(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PipelineError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    AppError {
        status,
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

fn require_user(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(unauthenticated)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /queries ============

#[derive(Deserialize)]
struct QueryBody {
    question: String,
    course_id: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Serialize)]
struct QueryResponseBody {
    query_id: String,
    answer: String,
    citations: Vec<String>,
    conversation_id: String,
}

async fn handle_query(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<QueryBody>,
) -> Result<Json<QueryResponseBody>, AppError> {
    let user_id = require_user(&headers)?;

    if body.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    if body.course_id.trim().is_empty() {
        return Err(bad_request("course_id must not be empty"));
    }

    let response = app
        .pipeline
        .run(QueryRequest {
            user_id,
            course_id: body.course_id,
            question: body.question,
            conversation_id: body.conversation_id,
        })
        .await
        .map_err(map_pipeline_error)?;

    Ok(Json(QueryResponseBody {
        query_id: response.query_id,
        answer: response.answer,
        citations: response.citations,
        conversation_id: response.conversation_id,
    }))
}

// ============ GET /queries/history ============

#[derive(Deserialize)]
struct HistoryParams {
    #[serde(default)]
    course_id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Serialize)]
struct HistoryResponse {
    records: Vec<QueryRecord>,
}

async fn handle_history(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, AppError> {
    let user_id = require_user(&headers)?;

    if !(1..=100).contains(&params.limit) {
        return Err(bad_request("limit must be between 1 and 100"));
    }
    if params.offset < 0 {
        return Err(bad_request("offset must be >= 0"));
    }

    let records = app
        .history
        .list(
            &user_id,
            &HistoryFilter {
                course_id: params.course_id,
                conversation_id: params.conversation_id,
                limit: params.limit,
                offset: params.offset,
            },
        )
        .await
        .map_err(map_pipeline_error)?;

    Ok(Json(HistoryResponse { records }))
}

// ============ GET /queries/conversations ============

#[derive(Serialize)]
struct ConversationsResponse {
    conversations: Vec<String>,
}

async fn handle_conversations(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Json<ConversationsResponse>, AppError> {
    let user_id = require_user(&headers)?;
    let conversations = app
        .history
        .conversations(&user_id)
        .await
        .map_err(map_pipeline_error)?;
    Ok(Json(ConversationsResponse { conversations }))
}

// ============ DELETE /queries/history/{id} ============

async fn handle_delete(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user_id = require_user(&headers)?;
    app.history
        .delete(&user_id, &id)
        .await
        .map_err(map_pipeline_error)?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}
