use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the Group Channel Subsystem.
///
/// `OptimisticConflict` is special: [`crate::service::with_optimistic_retry`]
/// recovers it internally with bounded retries and only lets it escape here
/// once attempts are exhausted. Every other variant is fatal to the call
/// that produced it.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("User does not exist: {0}")]
    UserDoesNotExist(String),

    #[error("Channel does not exist: {0}")]
    ChannelDoesNotExist(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Optimistic concurrency conflict")]
    OptimisticConflict,

    #[error("Internal server error")]
    Internal,
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message): (StatusCode, String) = match self {
            AppError::Database(e) => {
                tracing::error!(error = ?e, "database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".into())
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::UserDoesNotExist(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ChannelDoesNotExist(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::InvalidOperation(msg) => (StatusCode::CONFLICT, msg),
            AppError::OptimisticConflict => (
                StatusCode::CONFLICT,
                "Channel was modified concurrently; please retry".into(),
            ),
            AppError::Internal => {
                tracing::error!("internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validation_error_returns_400() {
        let response = AppError::Validation("bad name".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn not_found_errors_return_404() {
        assert_eq!(
            AppError::UserDoesNotExist("u1".into())
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::ChannelDoesNotExist("c1".into())
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn invalid_operation_returns_409() {
        let response = AppError::InvalidOperation("not a member".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn optimistic_conflict_returns_409() {
        let response = AppError::OptimisticConflict.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn internal_error_returns_500() {
        let response = AppError::Internal.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
