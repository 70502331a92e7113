use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Correlation identifier error: {0}")]
    Correlation(String),

    #[error("Cleanup in progress for calendar {0}")]
    CleanupInProgress(String),

    #[error("Teardown failure: {0}")]
    Teardown(String),

    #[error("Remote calendar API error: {0}")]
    RemoteApi(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::Correlation(msg) => {
                tracing::warn!("Correlation identifier error: {}", msg);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "CORRELATION_ERROR",
                    msg.clone(),
                )
            }
            AppError::CleanupInProgress(id) => (
                StatusCode::CONFLICT,
                "CLEANUP_IN_PROGRESS",
                format!("Calendar {} is locked until cleanup completes", id),
            ),
            AppError::Teardown(msg) => {
                tracing::error!("Teardown failure: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "TEARDOWN_FAILURE",
                    msg.clone(),
                )
            }
            AppError::RemoteApi(msg) => {
                tracing::error!("Remote calendar API error: {}", msg);
                (StatusCode::BAD_GATEWAY, "REMOTE_API_ERROR", msg.clone())
            }
            AppError::Credential(msg) => {
                tracing::error!("Credential error: {}", msg);
                (StatusCode::BAD_GATEWAY, "CREDENTIAL_ERROR", msg.clone())
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Request(e) => {
                tracing::error!("HTTP request error: {:?}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "EXTERNAL_REQUEST_FAILED",
                    "Failed to communicate with external service".to_string(),
                )
            }
            AppError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "Server configuration error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
