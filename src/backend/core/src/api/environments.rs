//! Environment endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;

use super::handlers::accepted;
use super::{ApiResponse, AppState};
use crate::error::ForgeError;
use crate::toolkit::ToolkitBackend;

#[derive(Debug, Deserialize)]
pub struct CreateEnvironmentRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct PackagesRequest {
    pub packages: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RuntimeRequest {
    pub backend: ToolkitBackend,
    #[serde(default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunScriptRequest {
    pub script_path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

pub async fn list_environments(State(state): State<AppState>) -> Result<impl IntoResponse, ForgeError> {
    Ok(Json(ApiResponse::success(state.environments.list().await?)))
}

pub async fn create_environment(
    State(state): State<AppState>,
    Json(req): Json<CreateEnvironmentRequest>,
) -> Result<impl IntoResponse, ForgeError> {
    let env = state.environments.create(&req.name).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(env))))
}

pub async fn get_environment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ForgeError> {
    Ok(Json(ApiResponse::success(state.environments.get(&name).await?)))
}

pub async fn delete_environment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ForgeError> {
    state.environments.delete(&name).await?;
    Ok(Json(ApiResponse::success(json!({ "name": name, "deleted": true }))))
}

pub async fn list_packages(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ForgeError> {
    Ok(Json(ApiResponse::success(state.environments.list_packages(&name).await?)))
}

pub async fn install_packages(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<PackagesRequest>,
) -> Result<impl IntoResponse, ForgeError> {
    if req.packages.is_empty() {
        return Err(ForgeError::validation("No packages given"));
    }
    // Reject unknown environments now rather than in the task.
    state.environments.get(&name).await?;

    let environments = state.environments.clone();
    let target = name.clone();
    let task_id = state.tasks.spawn("package_install", &target, move |reporter| async move {
        reporter.report(5, &format!("Installing {} package(s)", req.packages.len()));
        let report = environments.install_packages(&name, &req.packages).await?;
        Ok(serde_json::to_value(report)?)
    });
    Ok(accepted(task_id))
}

pub async fn uninstall_packages(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<PackagesRequest>,
) -> Result<impl IntoResponse, ForgeError> {
    let report = state.environments.uninstall_packages(&name, &req.packages).await?;
    Ok(Json(ApiResponse::success(report)))
}

pub async fn install_runtime(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<RuntimeRequest>,
) -> Result<impl IntoResponse, ForgeError> {
    state.environments.get(&name).await?;

    let environments = state.environments.clone();
    let detector = state.detector.clone();
    let target = format!("{}:{}", name, req.backend);
    let task_id = state.tasks.spawn("runtime_install", &target, move |reporter| async move {
        reporter.report(5, &format!("Installing {} runtime", req.backend));
        let outcome = environments
            .install_backend_runtime(&name, req.backend, &detector, req.model_id.as_deref())
            .await?;
        Ok(serde_json::to_value(outcome)?)
    });
    Ok(accepted(task_id))
}

pub async fn run_script(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<RunScriptRequest>,
) -> Result<impl IntoResponse, ForgeError> {
    let output = state.environments.run_script(&name, &req.script_path, &req.args).await?;
    Ok(Json(ApiResponse::success(output)))
}
