use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::broadcast::{EventBroadcaster, Subscription};
use crate::db::DbHandle;
use crate::errors::AnalyzerError;
use crate::models::{Job, JobSnapshot, ProgressEvent, RepoLocator};
use crate::pipeline::PipelineRunner;
use crate::qa::{Answer, QuestionService};

pub struct AppState {
    pub db: DbHandle,
    pub runner: PipelineRunner,
    pub broadcaster: EventBroadcaster,
    pub qa: QuestionService,
}

pub type SharedState = Arc<AppState>;

// ── Errors ────────────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    Internal(anyhow::Error),
}

impl From<AnalyzerError> for ApiError {
    fn from(err: AnalyzerError) -> Self {
        match err {
            AnalyzerError::InvalidInput(msg) => ApiError::BadRequest(msg),
            e @ AnalyzerError::NotFound(_) => ApiError::NotFound(e.to_string()),
            e @ (AnalyzerError::InvalidTransition { .. }
            | AnalyzerError::NotReady(..)
            | AnalyzerError::Cancelled(_)) => ApiError::Conflict(e.to_string()),
            AnalyzerError::UpstreamFailure(msg) => ApiError::BadGateway(msg),
            e @ AnalyzerError::StageFailure { .. } => ApiError::Internal(anyhow::anyhow!(e)),
            AnalyzerError::Other(e) => ApiError::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ── Request/response bodies ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct AnalyzeRequest {
    pub repository: String,
}

#[derive(Serialize)]
pub struct AnalyzeResponse {
    pub job_id: Uuid,
}

#[derive(Deserialize)]
pub struct AskRequest {
    pub question: String,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
pub struct ListResponse {
    pub jobs: Vec<Job>,
    pub total: i64,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(submit_analysis))
        .route("/analyze/{id}", get(stream_analysis))
        .route("/analyze/{id}/cancel", post(cancel_analysis))
        .route("/repo/{id}", get(get_repo))
        .route("/repo/{id}/ask", post(ask_repo))
        .route("/repos", get(list_repos))
}

/// Job ids arrive as raw path segments. A segment that is not a UUID cannot
/// name any job, so it reports the same way as an unknown one.
fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(format!("job {} not found", raw)))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn submit_analysis(
    State(state): State<SharedState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<(StatusCode, Json<AnalyzeResponse>), ApiError> {
    let locator = RepoLocator::parse(&req.repository).map_err(ApiError::BadRequest)?;
    let job = state.runner.submit(locator).await?;
    Ok((StatusCode::ACCEPTED, Json(AnalyzeResponse { job_id: job.id })))
}

async fn stream_analysis(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let sub = state.broadcaster.subscribe(job_id).await?;
    let stream = merged_events(job_id, sub).map(|event| Ok::<_, Infallible>(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Replayed history followed by the live feed, as one stream ending after
/// the terminal event. Events published during the subscribe handover show
/// up in both the replay and the live feed; the seq filter drops the live
/// copies, so each event is delivered exactly once.
fn merged_events(job_id: Uuid, sub: Subscription) -> impl Stream<Item = ProgressEvent> {
    let last_replayed = sub.replay.last().map(|e| e.seq).unwrap_or(0);
    let replay = futures::stream::iter(sub.replay);
    let live = futures::stream::unfold(sub.live, move |rx| async move {
        let mut rx = rx?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let next = if event.terminal { None } else { Some(rx) };
                    return Some((event, next));
                }
                // A lagged subscriber misses events; it can reconnect and
                // get the full history from the replay.
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(job_id = %job_id, skipped, "subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .filter(move |event| futures::future::ready(event.seq > last_replayed));
    replay.chain(live)
}

fn sse_event(event: &ProgressEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().data(data)
}

async fn cancel_analysis(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let job = state.runner.cancel(job_id).await?;
    Ok(Json(job))
}

async fn get_repo(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let snapshot = state
        .db
        .call(move |db| db.get_snapshot(job_id))
        .await?
        .ok_or(AnalyzerError::NotFound(job_id))?;
    Ok(Json(snapshot))
}

async fn list_repos(
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let offset = params.offset.unwrap_or(0).max(0);
    let (jobs, total) = state
        .db
        .call(move |db| Ok((db.list_jobs(limit, offset)?, db.count_jobs()?)))
        .await?;
    Ok(Json(ListResponse { jobs, total }))
}

async fn ask_repo(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Json<Answer>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let answer = state.qa.ask(job_id, &req.question).await?;
    Ok(Json(answer))
}

// ── Tests ─────────────────────────────────────────────────────────────
