//! HTTP API.
//!
//! Every success body is an [`ApiResponse`]; errors go through
//! `ForgeError`'s `IntoResponse`. Long operations (installs) answer `202`
//! with a task id that `GET /api/tasks/:id` reports on.

mod backends;
mod environments;
mod extensions;
mod handlers;
mod jobs;

use axum::{
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::context::AppContext;
use crate::error::ForgeError;

pub type AppState = AppContext;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        // Scheduler
        .route("/api/scheduler/status", get(handlers::scheduler_status))
        .route("/api/scheduler/reinitialize", post(handlers::reinitialize_scheduler))
        // Jobs
        .route("/api/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route(
            "/api/jobs/:id",
            get(jobs::get_job).put(jobs::update_job).delete(jobs::delete_job),
        )
        .route("/api/jobs/:id/run", post(jobs::run_job))
        .route("/api/jobs/:id/stop", post(jobs::stop_job))
        .route("/api/jobs/:id/status", get(jobs::job_status))
        .route("/api/jobs/:id/executions", get(jobs::list_executions))
        .route("/api/executions/:id", get(jobs::get_execution))
        // Backends
        .route("/api/backends", get(backends::list_backends))
        .route("/api/backends/installed", get(backends::list_installed))
        .route("/api/backends/updates", get(backends::check_updates))
        .route("/api/backends/:id/status", get(backends::backend_status))
        .route("/api/backends/:id/install", post(backends::install_backend))
        .route("/api/backends/:id/uninstall", post(backends::uninstall_backend))
        .route("/api/toolkits", get(backends::list_toolkits))
        // Environments
        .route(
            "/api/environments",
            get(environments::list_environments).post(environments::create_environment),
        )
        .route(
            "/api/environments/:name",
            get(environments::get_environment).delete(environments::delete_environment),
        )
        .route(
            "/api/environments/:name/packages",
            get(environments::list_packages).post(environments::install_packages),
        )
        .route(
            "/api/environments/:name/packages/uninstall",
            post(environments::uninstall_packages),
        )
        .route("/api/environments/:name/runtime", post(environments::install_runtime))
        .route("/api/environments/:name/run", post(environments::run_script))
        // Extensions
        .route("/api/extensions", get(extensions::list_extensions))
        .route("/api/extensions/refresh", post(extensions::refresh))
        .route("/api/extensions/:id/install", post(extensions::install_extension))
        // Background tasks
        .route("/api/tasks", get(handlers::list_tasks))
        .route("/api/tasks/:id", get(handlers::get_task))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// Standard API response wrapper.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    /// A failure that still carries data, such as the blocking execution id.
    pub fn failure(err: &ForgeError, data: T) -> Self {
        Self {
            success: false,
            data: Some(data),
            error: Some(err.user_message().to_string()),
            error_code: Some(err.code().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert_eq!(response.data, Some("test data"));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_failure_keeps_data_and_code() {
        let err = ForgeError::new(ErrorCode::JobAlreadyRunning, "Job is already running");
        let response = ApiResponse::failure(&err, 7);
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["data"], 7);
        assert_eq!(body["error_code"], "JobAlreadyRunning");
    }
}
