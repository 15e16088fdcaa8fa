//! Health, metrics, scheduler and task endpoints.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use uuid::Uuid;

use super::{ApiResponse, AppState};
use crate::error::ForgeError;

// ═══════════════════════════════════════════════════════════════════════════════
// Health Check
// ═══════════════════════════════════════════════════════════════════════════════

/// 200 while the database answers, 503 otherwise. A scheduler in
/// registry-only mode is reported but does not fail the check.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.db.health().await;
    let scheduler = state.scheduler.get_scheduler_status().await.ok();
    let healthy = database.healthy;
    let error = database.error.clone();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "database": database,
        "scheduler": scheduler,
    });
    (
        status,
        Json(ApiResponse {
            success: healthy,
            data: Some(body),
            error,
            error_code: None,
        }),
    )
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn scheduler_status(State(state): State<AppState>) -> Result<impl IntoResponse, ForgeError> {
    let status = state.scheduler.get_scheduler_status().await?;
    Ok(Json(ApiResponse::success(status)))
}

pub async fn reinitialize_scheduler(State(state): State<AppState>) -> Result<impl IntoResponse, ForgeError> {
    let status = state.scheduler.reinitialize().await?;
    Ok(Json(ApiResponse::success(status)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Background Tasks
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.tasks.list()))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ForgeError> {
    Ok(Json(ApiResponse::success(state.tasks.get(id)?)))
}

/// `202 Accepted` with the id of a freshly spawned task.
pub(super) fn accepted(task_id: Uuid) -> (StatusCode, Json<ApiResponse<serde_json::Value>>) {
    (
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(json!({ "task_id": task_id }))),
    )
}
