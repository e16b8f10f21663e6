//! RAG Memory Server
//!
//! HTTP API for the memory engine: retrieval, status and worker control.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rag_memory::{
    config::Config,
    embedding::LocalEmbeddingClient,
    record::EmbeddingKind,
    retrieval::{RetrievalRequest, RetrievalResult},
    service::{RagService, ServiceStatus},
    worker::FailedJob,
    Error,
};

type SharedState = Arc<RagService>;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting RAG Memory Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    // Initialize components
    let client = Arc::new(LocalEmbeddingClient::new(&config)?);
    let port = config.server_port;
    let state: SharedState = Arc::new(RagService::start(config, client)?);

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        // Retrieval
        .route("/retrieve", post(retrieve))
        .route("/retrieval/test", post(test_retrieval))
        .route("/rag/enable", post(enable))
        .route("/rag/disable", post(disable))
        // Embeddings
        .route("/embeddings/reset", post(reset))
        .route("/embeddings/:kind", delete(clear))
        // Summaries written by the summarizer
        .route("/conversations/:id/summary", post(save_conversation_summary))
        .route("/conversations/:id", delete(delete_conversation))
        .route("/exchanges/:id/summary", post(save_exchange_summary))
        .route("/exchanges/:id", delete(delete_exchange))
        // Worker control
        .route("/worker/pause", post(pause))
        .route("/worker/resume", post(resume))
        .route("/worker/wait-paused", post(wait_paused))
        .route("/worker/retry-failed", post(retry_failed))
        .route("/worker/failed", get(failed_jobs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if !state.shutdown(SHUTDOWN_TIMEOUT).await {
        tracing::warn!("Embedding worker was aborted during shutdown");
    }

    Ok(())
}

fn status_code(e: &Error) -> StatusCode {
    match e {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(e: Error) -> StatusCode {
    tracing::error!("Request failed: {}", e);
    status_code(&e)
}

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<SharedState>) -> Result<Json<ServiceStatus>, StatusCode> {
    state.status().map(Json).map_err(reject)
}

// --- Retrieval handlers ---

async fn retrieve(State(state): State<SharedState>, Json(req): Json<RetrievalRequest>) -> Json<RetrievalResult> {
    Json(state.retrieve(&req).await)
}

#[derive(Debug, Deserialize)]
struct TestRetrievalRequest {
    query: String,
}

async fn test_retrieval(
    State(state): State<SharedState>,
    Json(req): Json<TestRetrievalRequest>,
) -> Json<RetrievalResult> {
    Json(state.test_retrieval(&req.query).await)
}

#[derive(Debug, Serialize)]
struct EnabledResponse {
    enabled: bool,
}

async fn enable(State(state): State<SharedState>) -> Json<EnabledResponse> {
    state.enable();
    Json(EnabledResponse { enabled: true })
}

async fn disable(State(state): State<SharedState>) -> Json<EnabledResponse> {
    state.disable();
    Json(EnabledResponse { enabled: false })
}

// --- Embedding handlers ---

#[derive(Debug, Serialize)]
struct RemovedResponse {
    removed: usize,
}

async fn clear(
    State(state): State<SharedState>,
    Path(kind): Path<String>,
) -> Result<Json<RemovedResponse>, StatusCode> {
    let kind: EmbeddingKind = kind.parse().map_err(reject)?;
    let removed = state.clear(kind).map_err(reject)?;
    Ok(Json(RemovedResponse { removed }))
}

async fn reset(State(state): State<SharedState>) -> Result<Json<RemovedResponse>, StatusCode> {
    let removed = state.reset().map_err(reject)?;
    Ok(Json(RemovedResponse { removed }))
}

// --- Summary handlers ---

#[derive(Debug, Deserialize)]
struct ConversationSummaryRequest {
    summary: String,
    updated_at: Option<DateTime<Utc>>,
}

async fn save_conversation_summary(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ConversationSummaryRequest>,
) -> Result<StatusCode, StatusCode> {
    state
        .store()
        .save_conversation_summary(id, &req.summary, req.updated_at.unwrap_or_else(Utc::now))
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ExchangeSummaryRequest {
    conversation_id: i64,
    summary: String,
    updated_at: Option<DateTime<Utc>>,
}

async fn save_exchange_summary(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ExchangeSummaryRequest>,
) -> Result<StatusCode, StatusCode> {
    state
        .store()
        .save_exchange_summary(
            id,
            req.conversation_id,
            &req.summary,
            req.updated_at.unwrap_or_else(Utc::now),
        )
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_conversation(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    state.delete_conversation(id).map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_exchange(State(state): State<SharedState>, Path(id): Path<i64>) -> Result<StatusCode, StatusCode> {
    state.delete_exchange(id).map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Worker handlers ---

async fn pause(State(state): State<SharedState>) -> StatusCode {
    state.pause();
    StatusCode::ACCEPTED
}

async fn resume(State(state): State<SharedState>) -> StatusCode {
    state.resume();
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct WaitPausedRequest {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WaitPausedResponse {
    paused: bool,
}

async fn wait_paused(
    State(state): State<SharedState>,
    Json(req): Json<WaitPausedRequest>,
) -> Json<WaitPausedResponse> {
    let timeout = Duration::from_millis(req.timeout_ms.unwrap_or(5_000));
    Json(WaitPausedResponse {
        paused: state.wait_until_paused(timeout).await,
    })
}

#[derive(Debug, Serialize)]
struct RetryFailedResponse {
    released: usize,
}

async fn retry_failed(State(state): State<SharedState>) -> Json<RetryFailedResponse> {
    Json(RetryFailedResponse {
        released: state.retry_failed(),
    })
}

async fn failed_jobs(State(state): State<SharedState>) -> Json<Vec<FailedJob>> {
    Json(state.failed_jobs())
}
