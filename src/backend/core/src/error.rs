//! Error handling for Runforge Core.
//!
//! This module provides:
//! - One crate-wide error type with context and chaining
//! - HTTP status code mapping for API responses
//! - Stable error codes for machine-readable API responses
//! - User-facing messages kept apart from internal detail
//! - Logging and metrics integration
//!
//! Recoverable component-local conditions (a probe that finds nothing, a
//! backend that is not installed, a missing marker file) are modelled as
//! values by the components themselves. `ForgeError` is reserved for caller
//! contract violations, configuration errors and infrastructure failures.
//!
//! # Usage
//!
//! ```rust,ignore
//! use runforge_core::error::{ErrorCode, ErrorContext, ForgeError, Result};
//!
//! fn read_marker(path: &Path) -> Result<String> {
//!     std::fs::read_to_string(path).with_error_code(ErrorCode::MarkerInvalid)
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Runforge operations.
pub type Result<T> = std::result::Result<T, ForgeError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    ExecutionNotFound,
    JobAlreadyRunning,
    InvalidSchedule,
    MissingDispatchTarget,
    HandlerNotFound,
    DispatchFailed,
    SchedulerUnavailable,

    // Environment Errors (1100-1199)
    EnvironmentNotFound,
    EnvironmentExists,
    InvalidEnvironmentName,
    InterpreterMissing,
    PackageInstallFailed,
    ScriptFailed,

    // Backend Errors (1200-1299)
    BackendNotFound,
    BackendUnsupported,
    ReleaseUnavailable,
    AssetNotFound,
    DownloadFailed,
    DigestMismatch,
    ExtractionFailed,
    MarkerInvalid,

    // Toolkit Errors (1300-1399)
    ToolkitMissing,

    // Extension Errors (1400-1499)
    ExtensionNotFound,
    ExtensionIncompatible,

    // Task Errors (1500-1599)
    TaskNotFound,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    RecordNotFound,
    DuplicateRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // External Service Errors (3000-3099)
    ExternalServiceError,
    NetworkError,
    Timeout,
    SubprocessFailed,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,
    MissingRequiredField,
    InvalidFormat,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    PermissionDenied,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Job Errors
            Self::JobNotFound => 1000,
            Self::ExecutionNotFound => 1001,
            Self::JobAlreadyRunning => 1002,
            Self::InvalidSchedule => 1003,
            Self::MissingDispatchTarget => 1004,
            Self::HandlerNotFound => 1005,
            Self::DispatchFailed => 1006,
            Self::SchedulerUnavailable => 1007,

            // Environment Errors
            Self::EnvironmentNotFound => 1100,
            Self::EnvironmentExists => 1101,
            Self::InvalidEnvironmentName => 1102,
            Self::InterpreterMissing => 1103,
            Self::PackageInstallFailed => 1104,
            Self::ScriptFailed => 1105,

            // Backend Errors
            Self::BackendNotFound => 1200,
            Self::BackendUnsupported => 1201,
            Self::ReleaseUnavailable => 1202,
            Self::AssetNotFound => 1203,
            Self::DownloadFailed => 1204,
            Self::DigestMismatch => 1205,
            Self::ExtractionFailed => 1206,
            Self::MarkerInvalid => 1207,

            // Toolkit Errors
            Self::ToolkitMissing => 1300,

            // Extension Errors
            Self::ExtensionNotFound => 1400,
            Self::ExtensionIncompatible => 1401,

            // Task Errors
            Self::TaskNotFound => 1500,

            // Database Errors
            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            // Serialization Errors
            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            // External Service Errors
            Self::ExternalServiceError => 3000,
            Self::NetworkError => 3001,
            Self::Timeout => 3002,
            Self::SubprocessFailed => 3003,

            // Validation Errors
            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,
            Self::MissingRequiredField => 4102,
            Self::InvalidFormat => 4103,

            // Configuration Errors
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            // Internal Errors
            Self::InternalError => 9000,
            Self::PermissionDenied => 9001,
            Self::UnknownError => 9099,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            // Not Found (404)
            Self::JobNotFound
            | Self::ExecutionNotFound
            | Self::HandlerNotFound
            | Self::EnvironmentNotFound
            | Self::BackendNotFound
            | Self::ExtensionNotFound
            | Self::TaskNotFound
            | Self::RecordNotFound => StatusCode::NOT_FOUND,

            // Conflict (409)
            Self::JobAlreadyRunning | Self::EnvironmentExists | Self::DuplicateRecord => {
                StatusCode::CONFLICT
            }

            // Unprocessable Entity (422)
            Self::InvalidSchedule
            | Self::MissingDispatchTarget
            | Self::InvalidEnvironmentName
            | Self::BackendUnsupported
            | Self::ExtensionIncompatible
            | Self::ToolkitMissing
            | Self::ValidationError
            | Self::InvalidInput
            | Self::MissingRequiredField
            | Self::InvalidFormat => StatusCode::UNPROCESSABLE_ENTITY,

            // Timeout (504)
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // Forbidden (403)
            Self::PermissionDenied => StatusCode::FORBIDDEN,

            // Service Unavailable (503)
            Self::DatabaseConnectionFailed
            | Self::SchedulerUnavailable
            | Self::ReleaseUnavailable
            | Self::ExternalServiceError => StatusCode::SERVICE_UNAVAILABLE,

            // Bad Gateway (502)
            Self::NetworkError
            | Self::AssetNotFound
            | Self::DownloadFailed
            | Self::DigestMismatch => StatusCode::BAD_GATEWAY,

            // Internal Server Error (500)
            Self::DispatchFailed
            | Self::InterpreterMissing
            | Self::PackageInstallFailed
            | Self::ScriptFailed
            | Self::ExtractionFailed
            | Self::MarkerInvalid
            | Self::DatabaseError
            | Self::DatabaseQueryFailed
            | Self::SerializationError
            | Self::DeserializationError
            | Self::InvalidJson
            | Self::SubprocessFailed
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError
            | Self::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::ReleaseUnavailable
                | Self::DownloadFailed
                | Self::NetworkError
                | Self::Timeout
                | Self::ExternalServiceError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "environment",
            1200..=1299 => "backend",
            1300..=1399 => "toolkit",
            1400..=1499 => "extension",
            1500..=1599 => "task",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            3000..=3099 => "external_service",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown ids)
    Low,
    /// Operational issues (timeouts, missing toolkits, upstream hiccups)
    Medium,
    /// System errors (database failures, broken installs)
    High,
    /// The process cannot do useful work
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::ExecutionNotFound
            | ErrorCode::JobAlreadyRunning
            | ErrorCode::InvalidSchedule
            | ErrorCode::MissingDispatchTarget
            | ErrorCode::HandlerNotFound
            | ErrorCode::EnvironmentNotFound
            | ErrorCode::EnvironmentExists
            | ErrorCode::InvalidEnvironmentName
            | ErrorCode::BackendNotFound
            | ErrorCode::BackendUnsupported
            | ErrorCode::ExtensionNotFound
            | ErrorCode::ExtensionIncompatible
            | ErrorCode::TaskNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidFormat => Self::Low,

            ErrorCode::ToolkitMissing
            | ErrorCode::SchedulerUnavailable
            | ErrorCode::ReleaseUnavailable
            | ErrorCode::AssetNotFound
            | ErrorCode::DownloadFailed
            | ErrorCode::Timeout
            | ErrorCode::NetworkError
            | ErrorCode::ExternalServiceError
            | ErrorCode::DispatchFailed
            | ErrorCode::ScriptFailed
            | ErrorCode::PackageInstallFailed => Self::Medium,

            ErrorCode::InterpreterMissing
            | ErrorCode::DigestMismatch
            | ErrorCode::ExtractionFailed
            | ErrorCode::MarkerInvalid
            | ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson
            | ErrorCode::SubprocessFailed
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::PermissionDenied => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, environment, backend, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,

    /// Documentation or download link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_url: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    pub fn with_docs(mut self, url: impl Into<String>) -> Self {
        self.docs_url = Some(url.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.suggested_action.is_none()
            && self.docs_url.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Runforge Core.
#[derive(Error, Debug)]
pub struct ForgeError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-facing error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ForgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ForgeError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error for an arbitrary record.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Replace the error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    /// Attach a suggested action.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.details.suggested_action = Some(suggestion.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-facing message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    "request failed"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "request failed"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "request rejected"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "runforge_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()).to_lowercase(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&ForgeError> for ErrorResponse {
    fn from(error: &ForgeError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.is_empty() {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for ForgeError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| ForgeError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| ForgeError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| ForgeError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| ForgeError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for ForgeError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    return Self::with_internal(
                        ErrorCode::DuplicateRecord,
                        "A record with this identifier already exists",
                        db_err.message().to_string(),
                    )
                    .with_source(error);
                }
                (ErrorCode::DatabaseQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for ForgeError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::DatabaseError,
            "Database migration failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for ForgeError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (ErrorCode::Timeout, "External request timed out")
        } else if error.is_connect() {
            (ErrorCode::NetworkError, "Failed to connect to external service")
        } else if let Some(status) = error.status() {
            match status.as_u16() {
                500..=599 => (
                    ErrorCode::ExternalServiceError,
                    "External service is temporarily unavailable",
                ),
                _ => (
                    ErrorCode::ExternalServiceError,
                    "External service returned an error",
                ),
            }
        } else {
            (ErrorCode::NetworkError, "Network error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for ForgeError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::Timeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::task::JoinError> for ForgeError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "Background task failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for ForgeError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::RecordNotFound, "File or resource not found"),
            ErrorKind::PermissionDenied => (ErrorCode::PermissionDenied, "Permission denied"),
            ErrorKind::TimedOut => (ErrorCode::Timeout, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::NetworkError, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<zip::result::ZipError> for ForgeError {
    fn from(error: zip::result::ZipError) -> Self {
        Self::with_internal(
            ErrorCode::ExtractionFailed,
            "Failed to extract archive",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<anyhow::Error> for ForgeError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ForgeError>() {
            Ok(forge_error) => forge_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for ForgeError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl ForgeError {
    // ─────────────────────────────────────────────────────────────────────────
    // Job Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn job_not_found(job_id: i64) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
            .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    pub fn execution_not_found(execution_id: i64) -> Self {
        Self::new(
            ErrorCode::ExecutionNotFound,
            format!("Execution not found: {}", execution_id),
        )
        .with_details(ErrorDetails::new().with_entity("execution", execution_id.to_string()))
    }

    /// Rejected schedule configuration (bad cron, missing run_date, ...).
    pub fn invalid_schedule(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSchedule, message.into())
    }

    pub fn missing_dispatch_target(job_name: &str) -> Self {
        Self::new(
            ErrorCode::MissingDispatchTarget,
            format!(
                "Job '{}' has no function_name, api_endpoint or script_path",
                job_name
            ),
        )
    }

    pub fn dispatch_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DispatchFailed, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Environment Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn environment_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::EnvironmentNotFound,
            format!("Environment not found: {}", name),
        )
        .with_details(ErrorDetails::new().with_entity("environment", name))
    }

    pub fn environment_exists(name: &str) -> Self {
        Self::new(
            ErrorCode::EnvironmentExists,
            format!("Environment already exists: {}", name),
        )
        .with_details(ErrorDetails::new().with_entity("environment", name))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Backend Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn backend_not_found(backend_id: &str) -> Self {
        Self::new(
            ErrorCode::BackendNotFound,
            format!("Unknown backend: {}", backend_id),
        )
        .with_details(ErrorDetails::new().with_entity("backend", backend_id))
    }

    /// No release asset matched. Carries what was tried and what exists.
    pub fn asset_not_found(pattern: &str, available: &[String]) -> Self {
        Self::new(
            ErrorCode::AssetNotFound,
            format!(
                "No release asset matches '{}'. Available assets include: {}",
                pattern,
                available.join(", ")
            ),
        )
        .with_context("pattern", pattern)
        .with_context("available_assets", available)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Toolkit Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn toolkit_missing(toolkit: &str, install_url: Option<&str>) -> Self {
        let mut details = ErrorDetails::new()
            .with_entity("toolkit", toolkit)
            .with_suggestion(format!("Install the {} toolkit and retry", toolkit));
        if let Some(url) = install_url {
            details = details.with_docs(url);
        }
        Self::new(
            ErrorCode::ToolkitMissing,
            format!("Required toolkit not found: {}", toolkit),
        )
        .with_details(details)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Extension / Task Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn extension_not_found(extension_id: &str) -> Self {
        Self::new(
            ErrorCode::ExtensionNotFound,
            format!("Extension not found: {}", extension_id),
        )
        .with_details(ErrorDetails::new().with_entity("extension", extension_id))
    }

    pub fn task_not_found(task_id: uuid::Uuid) -> Self {
        Self::new(ErrorCode::TaskNotFound, format!("Task not found: {}", task_id))
            .with_details(ErrorDetails::new().with_entity("task", task_id.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numeric() {
        assert_eq!(ErrorCode::JobNotFound.numeric_code(), 1000);
        assert_eq!(ErrorCode::EnvironmentNotFound.numeric_code(), 1100);
        assert_eq!(ErrorCode::BackendNotFound.numeric_code(), 1200);
        assert_eq!(ErrorCode::InternalError.numeric_code(), 9000);
    }

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::JobNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::JobAlreadyRunning.http_status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::InvalidSchedule.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ErrorCode::AssetNotFound.http_status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::InvalidSchedule.category(), "job");
        assert_eq!(ErrorCode::PackageInstallFailed.category(), "environment");
        assert_eq!(ErrorCode::DigestMismatch.category(), "backend");
        assert_eq!(ErrorCode::ToolkitMissing.category(), "toolkit");
        assert_eq!(ErrorCode::DatabaseError.category(), "database");
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorCode::DownloadFailed.is_retryable());
        assert!(ErrorCode::NetworkError.is_retryable());
        assert!(!ErrorCode::InvalidSchedule.is_retryable());
        assert!(!ErrorCode::JobNotFound.is_retryable());
    }

    #[test]
    fn test_display_includes_internal_message() {
        let err = ForgeError::with_internal(ErrorCode::DatabaseError, "db failed", "locked");
        assert_eq!(err.to_string(), "[DatabaseError] db failed (internal: locked)");
    }

    #[test]
    fn test_asset_not_found_carries_pattern() {
        let err = ForgeError::asset_not_found(
            "llama-b1-bin-win-vulkan-x64.zip",
            &["llama-b1-bin-macos-arm64.zip".to_string()],
        );
        assert!(err.user_message().contains("llama-b1-bin-win-vulkan-x64.zip"));
        assert!(err.user_message().contains("llama-b1-bin-macos-arm64.zip"));
        assert!(err.details().context.contains_key("available_assets"));
    }

    #[test]
    fn test_error_response_omits_empty_details() {
        let err = ForgeError::validation("bad input");
        let response = ErrorResponse::from(&err);
        assert!(!response.success);
        assert!(response.error.details.is_none());
        assert_eq!(response.error.numeric_code, 4100);
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let err = missing.context("no such thing").unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: ForgeError = io.into();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
    }
}
