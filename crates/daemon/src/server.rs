//! Control endpoint for the portage daemon.
//!
//! Exposes the client/daemon protocol over HTTP/JSON on localhost. Every
//! mutating route forwards an intent to the queue processor and waits for
//! its reply; read-only routes serve the shared status snapshot. Malformed
//! requests are rejected with a descriptive 4xx without touching daemon
//! state.

use crate::job::{Conditions, Operation};
use crate::processor::{EnqueueSpec, FlushOutcome, FlushScope, ProcessorError, ProcessorHandle};
use crate::status::{ProcessingMode, ProgressCounts, SharedStatus};
use crate::store::StoreError;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

/// Errors that can occur when running the control server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub handle: ProcessorHandle,
    pub status: SharedStatus,
}

/// Body of `POST /enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Target queue; omitted means the focused queue.
    pub queue: Option<String>,
    /// Replace the target queue instead of appending.
    #[serde(default)]
    pub reset: bool,
    pub operation: Operation,
    pub sources: Vec<PathBuf>,
    pub destination: PathBuf,
    #[serde(default)]
    pub conditions: Conditions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_ids: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SelectRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlushRequest {
    pub queue: Option<String>,
    pub scope: FlushScope,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: ProcessingMode,
    pub queue: String,
    pub current_job_id: Option<u64>,
    pub last_error: Option<String>,
    pub counts: ProgressCounts,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending: usize,
    pub running: usize,
    pub total: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub current_job_id: Option<u64>,
    pub percent: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueuesResponse {
    pub names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Processor errors mapped onto HTTP statuses.
pub struct ApiError(ProcessorError);

impl From<ProcessorError> for ApiError {
    fn from(e: ProcessorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ProcessorError::Invalid(_) => StatusCode::BAD_REQUEST,
            ProcessorError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ProcessorError::Store(StoreError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Readiness marker used by the client's auto-launch handshake.
async fn ping() -> &'static str {
    "pong"
}

async fn enqueue(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let job_ids = state
        .handle
        .enqueue(EnqueueSpec {
            queue: req.queue,
            reset: req.reset,
            operation: req.operation,
            sources: req.sources,
            destination: req.destination,
            conditions: req.conditions,
        })
        .await?;
    Ok(Json(EnqueueResponse { job_ids }))
}

async fn select_queue(
    State(state): State<AppState>,
    Json(req): Json<SelectRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state.handle.select_queue(req.name).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn queue_start(State(state): State<AppState>) -> Result<Json<OkResponse>, ApiError> {
    state.handle.start().await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn queue_pause(State(state): State<AppState>) -> Result<Json<OkResponse>, ApiError> {
    state.handle.pause().await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn queue_stop(State(state): State<AppState>) -> Result<Json<OkResponse>, ApiError> {
    state.handle.stop().await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn flush(
    State(state): State<AppState>,
    Json(req): Json<FlushRequest>,
) -> Result<Json<FlushOutcome>, ApiError> {
    let outcome = state.handle.flush(req.queue, req.scope).await?;
    Ok(Json(outcome))
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.status.read().await.clone();
    Json(StatusResponse {
        state: snapshot.mode,
        queue: snapshot.queue,
        current_job_id: snapshot.current_job_id,
        last_error: snapshot.last_error,
        counts: snapshot.counts,
    })
}

async fn get_progress(State(state): State<AppState>) -> Json<ProgressResponse> {
    let snapshot = state.status.read().await.clone();
    let counts = snapshot.counts;
    Json(ProgressResponse {
        done: counts.done,
        skipped: counts.skipped,
        failed: counts.failed,
        pending: counts.pending,
        running: counts.running,
        total: counts.total,
        bytes_done: counts.bytes_done,
        bytes_total: counts.bytes_total,
        current_job_id: snapshot.current_job_id,
        percent: counts.percent(),
    })
}

async fn list_queues(State(state): State<AppState>) -> Result<Json<QueuesResponse>, ApiError> {
    let names = state.handle.list_queues().await?;
    Ok(Json(QueuesResponse { names }))
}

async fn shutdown(State(state): State<AppState>) -> Result<Json<OkResponse>, ApiError> {
    state.handle.shutdown().await?;
    Ok(Json(OkResponse { ok: true }))
}

/// Creates the axum Router with all protocol routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/enqueue", post(enqueue))
        .route("/queue/select", post(select_queue))
        .route("/queue/start", post(queue_start))
        .route("/queue/pause", post(queue_pause))
        .route("/queue/stop", post(queue_stop))
        .route("/queue/flush", post(flush))
        .route("/status", get(get_status))
        .route("/progress", get(get_progress))
        .route("/queues", get(list_queues))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

/// Runs the control server on 127.0.0.1:<port> until `shutdown` resolves.
pub async fn run_control_server(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control endpoint listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
