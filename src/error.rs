//! Structured error types for API responses and tool denials.

use serde::Serialize;
use std::fmt;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (4xx-like)
    ValidationError,
    InvalidFieldValue,
    InvalidTransition,
    NothingPending,

    // Not found errors
    NotFound,
    PipelineNotFound,
    TaskNotFound,

    // Staging outcomes
    PartialApply,
    RollbackUnavailable,

    // Internal errors
    DatabaseError,
    InternalError,
}

impl ErrorCode {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ErrorCode::NotFound | ErrorCode::PipelineNotFound | ErrorCode::TaskNotFound
        )
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::ValidationError
                | ErrorCode::InvalidFieldValue
                | ErrorCode::InvalidTransition
                | ErrorCode::NothingPending
        )
    }
}

/// Structured error for orchestrator and HTTP responses.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Convenience constructors

    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, reason).with_field(field)
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, reason).with_field(field)
    }

    pub fn pipeline_not_found(pipeline_id: i64) -> Self {
        Self::new(
            ErrorCode::PipelineNotFound,
            format!("Pipeline not found: {}", pipeline_id),
        )
    }

    pub fn task_not_found(task_id: i64) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
    }

    pub fn invalid_transition(pipeline_id: i64, from: &str, operation: &str) -> Self {
        Self::new(
            ErrorCode::InvalidTransition,
            format!(
                "Cannot {} pipeline {} while it is {}",
                operation, pipeline_id, from
            ),
        )
    }

    pub fn nothing_pending(pipeline_id: i64) -> Self {
        Self::new(
            ErrorCode::NothingPending,
            format!("Pipeline {} has no pending staged changes", pipeline_id),
        )
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ApiError>() {
            Ok(api_err) => api_err,
            Err(err) => match err.downcast::<rusqlite::Error>() {
                Ok(db_err) => ApiError::database(db_err),
                Err(err) => ApiError::internal(err),
            },
        }
    }
}

/// Result type for orchestrator operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Reason a tool invocation was refused before execution.
///
/// Denials are data: they travel inside a failed tool result rather than
/// as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Denial {
    #[error("TOOL_NOT_FOUND: {tool}")]
    ToolNotFound { tool: String },
    #[error("PLAN_MODE_BLOCKED: {tool}")]
    PlanModeBlocked { tool: String },
    #[error("RBAC_DENIED: {agent} may not call {tool}")]
    RbacDenied { agent: String, tool: String },
    #[error("GOVERNANCE_DENIED: {policy}: {reason}")]
    GovernanceDenied { policy: String, reason: String },
    #[error("INVALID_PARAMS: {reason}")]
    InvalidParams { reason: String },
}

impl Denial {
    /// Stable code string, e.g. `PLAN_MODE_BLOCKED`.
    pub fn code(&self) -> &'static str {
        match self {
            Denial::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            Denial::PlanModeBlocked { .. } => "PLAN_MODE_BLOCKED",
            Denial::RbacDenied { .. } => "RBAC_DENIED",
            Denial::GovernanceDenied { .. } => "GOVERNANCE_DENIED",
            Denial::InvalidParams { .. } => "INVALID_PARAMS",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_serialization() {
        let err = ApiError::validation("prompt", "prompt must be at least 5 characters");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "VALIDATION_ERROR");
        assert_eq!(value["field"], "prompt");
        assert!(value.get("details").is_none());
    }

    #[test]
    fn test_anyhow_downcast_keeps_api_error() {
        let err: anyhow::Error = ApiError::pipeline_not_found(9).into();
        let api: ApiError = err.into();
        assert_eq!(api.code, ErrorCode::PipelineNotFound);
    }

    #[test]
    fn test_anyhow_other_becomes_internal() {
        let api: ApiError = anyhow::anyhow!("boom").into();
        assert_eq!(api.code, ErrorCode::InternalError);
        assert_eq!(api.message, "boom");
    }

    #[test]
    fn test_denial_display_starts_with_code() {
        let denial = Denial::PlanModeBlocked {
            tool: "write_file".into(),
        };
        assert_eq!(denial.to_string(), "PLAN_MODE_BLOCKED: write_file");
        assert_eq!(denial.code(), "PLAN_MODE_BLOCKED");

        let denial = Denial::GovernanceDenied {
            policy: "no-env".into(),
            reason: "secrets".into(),
        };
        assert!(denial.to_string().starts_with(denial.code()));
        let value = serde_json::to_value(&denial).unwrap();
        assert_eq!(value["code"], "GOVERNANCE_DENIED");
        assert_eq!(value["policy"], "no-env");
    }
}
