use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::ingest::error::IngestError;
use crate::ingest::job::{IngestionJob, JobId, JobStatus};
use crate::ingest::scheduler::Scheduler;
use crate::ingest::types::SourceDescriptor;

const DEFAULT_JOBS_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/scrape", post(scrape_all))
        .route("/scrape/{source_id}", post(scrape_one))
        .route("/cleanup", post(cleanup))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/sources", get(list_sources))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(serde::Serialize)]
struct TriggerResp {
    job_id: JobId,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

/// 202 for a queued job, 503 when no worker could take it.
fn accepted(job: IngestionJob) -> Response {
    let code = if job.status == JobStatus::Failed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::ACCEPTED
    };
    let body = TriggerResp {
        job_id: job.id,
        status: job.status,
        failure: job.failure,
    };
    (code, Json(body)).into_response()
}

fn error(code: StatusCode, msg: impl std::fmt::Display) -> Response {
    (code, Json(json!({ "error": msg.to_string() }))).into_response()
}

async fn scrape_all(State(state): State<AppState>) -> Response {
    match state.scheduler.trigger_now(None) {
        Ok(job) => accepted(job),
        Err(e) => error(StatusCode::BAD_REQUEST, e),
    }
}

async fn scrape_one(State(state): State<AppState>, Path(source_id): Path<String>) -> Response {
    match state.scheduler.trigger_now(Some(&source_id)) {
        Ok(job) => accepted(job),
        Err(e @ IngestError::UnknownSource(_)) => error(StatusCode::NOT_FOUND, e),
        Err(e) => error(StatusCode::BAD_REQUEST, e),
    }
}

async fn cleanup(State(state): State<AppState>) -> Response {
    accepted(state.scheduler.trigger_cleanup())
}

#[derive(serde::Deserialize)]
struct JobsQuery {
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(q): Query<JobsQuery>,
) -> Json<Vec<IngestionJob>> {
    let n = q.limit.unwrap_or(DEFAULT_JOBS_LIMIT).min(1_000);
    Json(state.scheduler.registry().snapshot_last_n(n))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<JobId>) -> Response {
    match state.scheduler.registry().get(id) {
        Some(job) => Json(job).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("unknown job {id}")),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<JobId>) -> Response {
    if state.scheduler.cancel(id) {
        Json(json!({ "job_id": id, "cancelled": true })).into_response()
    } else {
        error(StatusCode::NOT_FOUND, format!("job {id} is not pending or running"))
    }
}

async fn list_sources(State(state): State<AppState>) -> Json<Vec<SourceDescriptor>> {
    Json(
        state
            .scheduler
            .ingestor()
            .sources()
            .iter()
            .map(SourceDescriptor::redacted)
            .collect(),
    )
}
