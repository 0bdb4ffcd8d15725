//! # Error Handling
//!
//! Crate-level error types and their mapping to HTTP responses. Errors in
//! the streaming transcription path never reach this layer — the scheduler
//! contains them — so these cover the REST surface: configuration,
//! validation, uploads, and the one-shot transcription endpoint.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Server port cannot be 0",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Application error taxonomy for the HTTP surface.
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems (I/O failures, lock poisoning, ...)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource does not exist
    NotFound(String),

    /// Configuration loading or parsing problems
    ConfigError(String),

    /// Input failed validation rules
    ValidationError(String),

    /// One-shot transcription pipeline failure (converter or engine)
    Transcription(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Transcription(msg) => write!(f, "Transcription error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::Transcription(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "transcription_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Multipart error: {}", err))
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_code_mapping() {
        let cases = [
            (
                AppError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                AppError::ConfigError("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                AppError::ValidationError("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::Transcription("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.error_response().status(), expected);
        }
    }

    #[test]
    fn test_display_includes_message() {
        let err = AppError::Transcription("engine exploded".into());
        assert_eq!(err.to_string(), "Transcription error: engine exploded");
    }
}
