// src/error.rs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::services::backend::BackendError;

/// Global Application Error Enum.
/// Centralizes error handling and mapping to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    // 500 Internal Server Error
    InternalServerError(String),

    // 400 Bad Request (validation failures, never queued)
    BadRequest(String),

    // 401 Unauthorized
    AuthError(String),

    // 403 Forbidden
    Forbidden(String),

    // 404 Not Found
    NotFound(String),

    // 409 Conflict
    Conflict(String),

    // 503 with kind "offline": no internet or backend unreachable
    Offline(String),

    // 503 with kind "unavailable": backend misconfigured
    Unavailable(String),

    // 502 Bad Gateway: the backend answered with a failure
    Upstream(String),
}

impl AppError {
    /// Short machine-readable classification sent alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InternalServerError(_) => "internal",
            AppError::BadRequest(_) => "validation",
            AppError::AuthError(_) => "auth",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Offline(_) => "offline",
            AppError::Unavailable(_) => "unavailable",
            AppError::Upstream(_) => "server",
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for AppError {}

/// Implements `IntoResponse` for `AppError`.
/// Converts the error into a JSON response with appropriate HTTP status code.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let (status, error_message) = match self {
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::AuthError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Offline(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Unavailable(msg) => {
                tracing::error!("Backend unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            AppError::Upstream(msg) => {
                tracing::warn!("Backend failure: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "The server could not complete the request. Please try again later."
                        .to_string(),
                )
            }
        };
        let body = Json(json!({
            "error": error_message,
            "kind": kind,
        }));

        (status, body).into_response()
    }
}

/// Converts `sqlx::Error` into `AppError::InternalServerError`.
/// Allows using `?` operator on database queries.
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::InternalServerError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

/// Classifies remote failures so raw backend errors never reach the UI.
impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        if err.is_connectivity() {
            return AppError::Offline(
                "No internet connection. Check your network and try again.".to_string(),
            );
        }
        match err {
            BackendError::NotConfigured => {
                AppError::Unavailable("The backend service is not configured.".to_string())
            }
            BackendError::Duplicate => AppError::Conflict("Record already exists".to_string()),
            BackendError::Unauthorized(msg) => AppError::AuthError(msg),
            BackendError::NotFound => AppError::NotFound("Record not found".to_string()),
            BackendError::Rejected { status, message } if (400..500).contains(&status) => {
                AppError::BadRequest(message)
            }
            other => AppError::Upstream(other.to_string()),
        }
    }
}
