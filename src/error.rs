use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

use crate::codec::CodecError;

/// Failures raised by the sync layer and its backends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("write denied at '{path}'")]
    WriteDenied { path: String },

    #[error("write failed at '{path}': {detail}")]
    WriteFailed { path: String, detail: String },

    #[error("read failed at '{path}': {detail}")]
    ReadFailed { path: String, detail: String },
}

/// Errors surfaced by the domain handlers and the HTTP routes.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Login required")]
    Unauthenticated,

    #[error("Permission Denied: {0}")]
    Unauthorized(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("System Error: Corrupted file data ({0})")]
    CorruptPayload(String),

    #[error("System Warning: This legacy resource was uploaded without content storage")]
    ContentUnavailable,

    #[error("Database Permission Denied at '{path}'")]
    WriteDenied { path: String },

    #[error("Write failed at '{path}': {detail}")]
    WriteFailed { path: String, detail: String },

    #[error("Something went wrong: {0}")]
    Transient(String),
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::WriteDenied { path } => AppError::WriteDenied { path },
            StoreError::WriteFailed { path, detail } => AppError::WriteFailed { path, detail },
            StoreError::ReadFailed { .. } => AppError::Transient(error.to_string()),
        }
    }
}

impl From<CodecError> for AppError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::CorruptPayload(detail) => AppError::CorruptPayload(detail),
            CodecError::ContentUnavailable => AppError::ContentUnavailable,
            CodecError::TooLarge { .. } => AppError::ValidationFailed(error.to_string()),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AppError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::CorruptPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ContentUnavailable => StatusCode::GONE,
            AppError::WriteDenied { .. } => StatusCode::FORBIDDEN,
            AppError::WriteFailed { .. } => StatusCode::BAD_GATEWAY,
            AppError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .content_type("text/plain")
            .body(self.to_string())
    }
}
