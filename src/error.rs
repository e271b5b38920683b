use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::models::Stage;

/// Application-level errors
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Candidate source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Stage {stage} exceeded its {budget_ms}ms budget")]
    Timeout { stage: Stage, budget_ms: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("Request cancelled during {0}")]
    Cancelled(Stage),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::SourceUnavailable(_) => "source_unavailable",
            AppError::Timeout { .. } => "timeout",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::InternalInconsistency(_) => "internal_inconsistency",
            AppError::Cancelled(_) => "cancelled",
            AppError::Database(_) => "database",
            AppError::Cache(_) => "cache",
            AppError::Internal(_) => "internal",
        }
    }

    /// Pipeline stage the error is attached to, when known
    pub fn stage(&self) -> Option<Stage> {
        match self {
            AppError::Timeout { stage, .. } | AppError::Cancelled(stage) => Some(*stage),
            AppError::SourceUnavailable(_) => Some(Stage::Fetch),
            _ => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            // Client closed request
            AppError::Cancelled(_) => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            AppError::InternalInconsistency(_)
            | AppError::Database(_)
            | AppError::Cache(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let mut body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let Some(stage) = self.stage() {
            body["stage"] = json!(stage);
        }

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_status_codes() {
        assert_eq!(
            AppError::SourceUnavailable("down".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Timeout {
                stage: Stage::Fetch,
                budget_ms: 10
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            AppError::InvalidRequest("limit".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::InternalInconsistency("nan".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::Cancelled(Stage::Score).status_code().as_u16(),
            499
        );
    }

    #[test]
    fn test_timeout_names_stage() {
        let err = AppError::Timeout {
            stage: Stage::Rank,
            budget_ms: 25,
        };
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.stage(), Some(Stage::Rank));
        assert!(err.to_string().contains("rank"));
        assert!(err.to_string().contains("25ms"));
    }
}
