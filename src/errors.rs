use crate::services::{file_service::FileError, object_store::StoreError, validator::ValidationError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    /// Map an orchestration failure to a client-facing error.
    ///
    /// Client errors carry a short reason. Everything else becomes
    /// `fallback` so store error text never reaches the caller; the full
    /// error is logged here instead.
    pub fn from_file_error(err: FileError, fallback: &str) -> Self {
        match err {
            FileError::Validation(ValidationError::UnsupportedExtension(_)) => {
                Self::bad_request("Unsupported file extension")
            }
            FileError::Validation(ValidationError::UnsupportedContentType { .. }) => {
                Self::bad_request("Unsupported file type")
            }
            FileError::Validation(_) => Self::bad_request("Invalid file content"),
            FileError::RecordNotFound(_)
            | FileError::StorageReadFailed {
                source: StoreError::NotFound(_) | StoreError::InvalidKey(_),
                ..
            } => Self::not_found("File not found"),
            FileError::Conflict(_) => Self::new(StatusCode::CONFLICT, "File was modified concurrently"),
            FileError::TimedOut(_) => {
                tracing::error!(error = %err, "{}", fallback);
                Self::new(StatusCode::GATEWAY_TIMEOUT, fallback)
            }
            other => {
                tracing::error!(error = %other, "{}", fallback);
                Self::internal(fallback)
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}
