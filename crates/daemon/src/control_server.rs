//! Control HTTP server for the re-encode daemon
//!
//! Exposes queue inspection, pause/resume, concurrency, job restart, library
//! scans and schedule rule management as a small JSON API.

use crate::daemon::Library;
use crate::dispatch::{DispatchControl, DispatchEngine, DispatchError, QueueSnapshot};
use crate::jobs::EncodingJob;
use crate::scan::{DiscoveryError, ScanSummary};
use crate::schedule::{ScheduleError, ScheduleRule, ScheduleRuleInput, WindowScheduler};
use crate::store::StoreError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Errors that can occur when running the control server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// Shared handles the routes operate on.
#[derive(Clone)]
pub struct ControlState {
    pub dispatch: Arc<DispatchEngine>,
    pub scheduler: Arc<WindowScheduler>,
    pub library: Arc<Library>,
}

/// Error body returned by every route: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "Control request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, e.to_string()),
            StoreError::Conflict { .. } | StoreError::OpenJobExists { .. } => {
                ApiError::new(StatusCode::CONFLICT, e.to_string())
            }
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, e.to_string()),
            DispatchError::InvalidState { .. } => ApiError::new(StatusCode::CONFLICT, e.to_string()),
            DispatchError::Store(inner) => inner.into(),
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::Invalid(_) => ApiError::new(StatusCode::BAD_REQUEST, e.to_string()),
            ScheduleError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, e.to_string()),
            ScheduleError::Store(inner) => inner.into(),
        }
    }
}

impl From<DiscoveryError> for ApiError {
    fn from(e: DiscoveryError) -> Self {
        match e {
            DiscoveryError::RootNotFound(_) => ApiError::new(StatusCode::BAD_REQUEST, e.to_string()),
            DiscoveryError::Store(inner) => inner.into(),
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Pause state and pool size after a control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub paused: bool,
    pub concurrency_limit: usize,
    pub active_count: usize,
}

impl QueueState {
    fn of(dispatch: &DispatchEngine) -> Self {
        Self {
            paused: dispatch.is_paused(),
            concurrency_limit: dispatch.concurrency_limit(),
            active_count: dispatch.active_count(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyRequest {
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub root: PathBuf,
}

async fn get_queue(State(state): State<ControlState>) -> ApiResult<QueueSnapshot> {
    Ok(Json(state.dispatch.queue_snapshot()?))
}

async fn pause(State(state): State<ControlState>) -> Json<QueueState> {
    state.dispatch.pause();
    Json(QueueState::of(&state.dispatch))
}

async fn resume(State(state): State<ControlState>) -> Json<QueueState> {
    state.dispatch.resume();
    Json(QueueState::of(&state.dispatch))
}

async fn set_concurrency(
    State(state): State<ControlState>,
    Json(req): Json<ConcurrencyRequest>,
) -> Json<QueueState> {
    state.dispatch.set_concurrency_limit(req.limit);
    Json(QueueState::of(&state.dispatch))
}

async fn restart_job(
    State(state): State<ControlState>,
    Path(id): Path<i64>,
) -> ApiResult<EncodingJob> {
    state.dispatch.restart_job(id)?;
    let job = state
        .dispatch
        .get_job(id)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("job {} not found", id)))?;
    Ok(Json(job))
}

async fn search_jobs(
    State(state): State<ControlState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Vec<EncodingJob>> {
    Ok(Json(state.dispatch.search_jobs(&params.q)?))
}

async fn scan(
    State(state): State<ControlState>,
    Json(req): Json<ScanRequest>,
) -> ApiResult<ScanSummary> {
    Ok(Json(state.library.scan(&req.root).await?))
}

async fn list_schedules(State(state): State<ControlState>) -> ApiResult<Vec<ScheduleRule>> {
    Ok(Json(state.scheduler.list_rules()?))
}

async fn create_schedule(
    State(state): State<ControlState>,
    Json(input): Json<ScheduleRuleInput>,
) -> Result<(StatusCode, Json<ScheduleRule>), ApiError> {
    let rule = state.scheduler.create_rule(input)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_schedule(
    State(state): State<ControlState>,
    Path(id): Path<i64>,
    Json(input): Json<ScheduleRuleInput>,
) -> ApiResult<ScheduleRule> {
    Ok(Json(state.scheduler.update_rule(id, input)?))
}

async fn delete_schedule(
    State(state): State<ControlState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.delete_rule(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Creates the axum Router with every control route
pub fn create_control_router(state: ControlState) -> Router {
    Router::new()
        .route("/queue", get(get_queue))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/concurrency", put(set_concurrency))
        .route("/jobs/search", get(search_jobs))
        .route("/jobs/:id/restart", post(restart_job))
        .route("/scan", post(scan))
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route("/schedules/:id", put(update_schedule).delete(delete_schedule))
        .with_state(state)
}

pub async fn bind_listener(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Serve the control API until `shutdown` fires.
pub async fn serve_control(
    listener: TcpListener,
    state: ControlState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Control server listening");
    }
    axum::serve(listener, create_control_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(ServerError::Serve)
}
