use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use jobforge_core::{ConfigMap, EngineError, Job, JobExecution, JobSchedule, TriggerKind};
use jobforge_scheduler::{Engine, QueueMetrics, ReconcileReport};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

/// Shared application state for API handlers.
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Build the Axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/metrics", get(metrics))
        .route("/api/jobs/{id}", put(register_job))
        .route("/api/jobs/{id}/run", post(run_job))
        .route("/api/jobs/{id}/schedule", post(schedule_job).delete(unschedule_job))
        .route("/api/jobs/{id}/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/dispatches/{id}/cancel", post(cancel_dispatch))
        .route("/api/maintenance/reconcile", post(reconcile))
        .route("/api/maintenance/handler-cache/invalidate", post(invalidate_cache))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// `{ "error": kind, "message": ... }` with the matching HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status =
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %e, kind = e.kind(), "Admin request failed");
        }
        Self {
            status,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.kind, "message": self.message }));
        (self.status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// An absent body reads as `T::default()`.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

fn required_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobRequest {
    name: String,
    module_id: String,
    handler: String,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    /// `0` takes the engine default.
    #[serde(default)]
    timeout_ms: u64,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    config: ConfigMap,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    #[serde(default)]
    priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    cron: String,
    #[serde(default)]
    timezone: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvalidateRequest {
    #[serde(default)]
    module_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "jobforge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<QueueMetrics> {
    Ok(Json(state.engine.metrics().await?))
}

async fn register_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    body: Bytes,
) -> ApiResult<Job> {
    let request: JobRequest = required_body(&body)?;
    let mut job = Job::new(job_id, request.name, request.module_id, request.handler);
    job.schedule = request.schedule;
    job.enabled = request.enabled;
    job.timeout_ms = request.timeout_ms;
    job.retries = request.retries;
    job.config = request.config;
    let job = state.engine.register_job(job).await?;
    Ok(Json(job))
}

async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    body: Bytes,
) -> ApiResult<Value> {
    let request: RunRequest = optional_body(&body)?;
    let priority = request
        .priority
        .unwrap_or(state.engine.settings().default_priority);
    let dispatch_id = state
        .engine
        .enqueue_with_priority(&job_id, TriggerKind::Manual, priority)
        .await?;
    info!(job_id = %job_id, dispatch_id = %dispatch_id, "Manual run requested");
    Ok(Json(json!({ "jobId": job_id, "dispatchId": dispatch_id })))
}

async fn schedule_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    body: Bytes,
) -> ApiResult<JobSchedule> {
    let request: ScheduleRequest = required_body(&body)?;
    let schedule = state
        .engine
        .schedule_job(&job_id, &request.cron, request.timezone.as_deref())
        .await?;
    Ok(Json(schedule))
}

async fn unschedule_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Value> {
    let removed = state.engine.unschedule(&job_id).await?;
    Ok(Json(json!({ "jobId": job_id, "removed": removed })))
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Value> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let executions = state.engine.executions(&job_id, limit).await?;
    Ok(Json(json!({ "jobId": job_id, "executions": executions })))
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<JobExecution> {
    match state.engine.execution(&execution_id).await? {
        Some(execution) => Ok(Json(execution)),
        None => Err(ApiError::not_found(
            "execution_not_found",
            format!("execution not found: {execution_id}"),
        )),
    }
}

async fn cancel_dispatch(
    State(state): State<Arc<AppState>>,
    Path(dispatch_id): Path<String>,
) -> ApiResult<Value> {
    let outcome = state.engine.cancel(&dispatch_id).await?;
    Ok(Json(json!({ "dispatchId": dispatch_id, "outcome": outcome })))
}

async fn reconcile(State(state): State<Arc<AppState>>) -> ApiResult<ReconcileReport> {
    Ok(Json(state.engine.reconcile_orphans().await?))
}

async fn invalidate_cache(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Value> {
    let request: InvalidateRequest = optional_body(&body)?;
    let removed = state
        .engine
        .invalidate_handler_cache(request.module_id.as_deref())
        .await;
    Ok(Json(json!({ "moduleId": request.module_id, "removed": removed })))
}
