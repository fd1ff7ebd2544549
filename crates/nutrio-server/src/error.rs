//! Error types for the Nutrio server.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::db::ACQUIRE_TIMEOUT;
use crate::engine::ReconcileError;
use crate::store::StoreError;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    #[error("Retry later: {message}")]
    RetryLater {
        message: String,
        /// Seconds the caller should wait.
        retry_after: u64,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            // Pool exhausted: the request is fine, the server is busy
            StoreError::Database(sqlx::Error::PoolTimedOut) => AppError::RetryLater {
                message: "Database busy, retry later".to_string(),
                retry_after: ACQUIRE_TIMEOUT.as_secs(),
            },
            StoreError::Database(e) => AppError::Database(e),
            StoreError::OrderNotFound(id) => AppError::NotFound(format!("Order {} not found", id)),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Store(e) => e.into(),
            ReconcileError::OrderNotFound { .. } => AppError::NotFound(e.to_string()),
            ReconcileError::InvalidTransition(t) => AppError::Unprocessable(t.to_string()),
            ReconcileError::Receipt(_) | ReconcileError::UnknownProduct(_) => {
                AppError::Unprocessable(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg).into_response(),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg).into_response(),
            AppError::RetryLater {
                message,
                retry_after,
            } => {
                tracing::warn!(retry_after, "{}", message);
                let mut response = (StatusCode::SERVICE_UNAVAILABLE, message).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}
