//! Extension catalog endpoints.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use super::handlers::accepted;
use super::{ApiResponse, AppState};
use crate::error::ForgeError;
use crate::extensions::ExtensionFilter;

#[derive(Debug, Deserialize)]
pub struct InstallExtensionRequest {
    pub venv_name: String,
    #[serde(default)]
    pub model_id: Option<String>,
}

pub async fn list_extensions(
    State(state): State<AppState>,
    Query(filter): Query<ExtensionFilter>,
) -> Result<impl IntoResponse, ForgeError> {
    Ok(Json(ApiResponse::success(state.extensions.list_extensions(&filter).await?)))
}

/// Drop the toolkit cache and probe again.
pub async fn refresh(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.extensions.refresh().await))
}

pub async fn install_extension(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InstallExtensionRequest>,
) -> Result<impl IntoResponse, ForgeError> {
    // Unknown ids and environments fail synchronously.
    state.extensions.get(&id).await?;
    state.environments.get(&req.venv_name).await?;

    let extensions = state.extensions.clone();
    let target = format!("{}:{}", id, req.venv_name);
    let task_id = state.tasks.spawn("extension_install", &target, move |reporter| async move {
        reporter.report(5, &format!("Installing {} into {}", id, req.venv_name));
        let outcome = extensions
            .install(&id, &req.venv_name, req.model_id.as_deref())
            .await?;
        Ok(serde_json::to_value(outcome)?)
    });
    Ok(accepted(task_id))
}
