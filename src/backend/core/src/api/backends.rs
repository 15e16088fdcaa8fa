//! Backend and toolkit endpoints.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use super::handlers::accepted;
use super::{ApiResponse, AppState};
use crate::backends::BackendId;
use crate::error::ForgeError;

pub async fn list_backends(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.installer.get_available_backends()))
}

pub async fn list_installed(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.installer.list_installed()))
}

pub async fn check_updates(State(state): State<AppState>) -> Result<impl IntoResponse, ForgeError> {
    Ok(Json(ApiResponse::success(state.installer.check_for_updates().await?)))
}

pub async fn backend_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ForgeError> {
    let id: BackendId = id.parse()?;
    Ok(Json(ApiResponse::success(state.installer.check_backend_installed(id))))
}

pub async fn install_backend(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ForgeError> {
    let id: BackendId = id.parse()?;
    let installer = state.installer.clone();
    let task_id = state.tasks.spawn("backend_install", id.as_str(), move |reporter| async move {
        let progress = |percent: u8, message: &str| reporter.report(percent, message);
        let installed = installer.install_backend(id, &progress).await?;
        Ok(serde_json::to_value(installed)?)
    });
    Ok(accepted(task_id))
}

pub async fn uninstall_backend(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ForgeError> {
    let id: BackendId = id.parse()?;
    Ok(Json(ApiResponse::success(state.installer.uninstall_backend(id).await?)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolkitQuery {
    #[serde(default)]
    pub refresh: bool,
}

pub async fn list_toolkits(
    State(state): State<AppState>,
    Query(query): Query<ToolkitQuery>,
) -> impl IntoResponse {
    Json(ApiResponse::success(state.detector.detect_all(query.refresh).await))
}
