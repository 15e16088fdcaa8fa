//! Job and execution endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::{ApiResponse, AppState};
use crate::error::{ErrorCode, ForgeError};
use crate::jobs::{ExecutionId, JobFilter, JobId, JobUpdate, NewJob, RunOutcome};

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(filter): Query<JobFilter>,
) -> Result<impl IntoResponse, ForgeError> {
    let jobs = state.scheduler.list_jobs(&filter).await?;
    Ok(Json(ApiResponse::success(jobs)))
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(new): Json<NewJob>,
) -> Result<impl IntoResponse, ForgeError> {
    if new.name.trim().is_empty() {
        return Err(ForgeError::validation("Job name cannot be empty"));
    }
    let job = state.scheduler.create_job(new).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(job))))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<impl IntoResponse, ForgeError> {
    Ok(Json(ApiResponse::success(state.scheduler.get_job(id).await?)))
}

pub async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(update): Json<JobUpdate>,
) -> Result<impl IntoResponse, ForgeError> {
    Ok(Json(ApiResponse::success(state.scheduler.update_job(id, update).await?)))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub keep_history: bool,
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, ForgeError> {
    state.scheduler.delete_job(id, query.keep_history).await?;
    Ok(Json(ApiResponse::success(json!({ "id": id, "deleted": true }))))
}

/// 202 with the new execution id, or 409 naming the run in flight.
pub async fn run_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<impl IntoResponse, ForgeError> {
    let response = match state.scheduler.run_job_now(id).await? {
        RunOutcome::Started { execution_id } => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(json!({ "execution_id": execution_id }))),
        ),
        RunOutcome::Conflict { execution_id } => {
            let err = ForgeError::new(ErrorCode::JobAlreadyRunning, "Job is already running");
            (
                StatusCode::CONFLICT,
                Json(ApiResponse::failure(&err, json!({ "execution_id": execution_id }))),
            )
        }
    };
    Ok(response)
}

pub async fn stop_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<impl IntoResponse, ForgeError> {
    Ok(Json(ApiResponse::success(state.scheduler.stop_job(id).await?)))
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<impl IntoResponse, ForgeError> {
    Ok(Json(ApiResponse::success(state.scheduler.get_job_status(id).await?)))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

pub async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ForgeError> {
    let executions = state.scheduler.list_executions(id, query.limit).await?;
    Ok(Json(ApiResponse::success(executions)))
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<ExecutionId>,
) -> Result<impl IntoResponse, ForgeError> {
    Ok(Json(ApiResponse::success(state.scheduler.get_execution(id).await?)))
}
