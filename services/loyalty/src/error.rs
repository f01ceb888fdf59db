use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Entity referenced by a failed lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Member,
    TestType,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Member => write!(f, "member"),
            Entity::TestType => write!(f, "test type"),
        }
    }
}

/// Input field rejected by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    MediaType,
    Cost,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::MediaType => write!(f, "media type"),
            Field::Cost => write!(f, "cost"),
        }
    }
}

/// Errors surfaced by the ingestion pipeline.
///
/// `Unauthorized`, `NotFound`, `InvalidInput` and `UploadConflict` are
/// rejected before or at the first mutation and are not retriable.
/// `Storage` covers transient object-store failures; `Bookkeeping` wraps a
/// relational failure that occurred after a successful upload, in which case
/// the compensating delete has already been attempted by the time the error
/// reaches the caller.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("caller is not authorized to record test results")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(Entity),

    #[error("invalid {0}")]
    InvalidInput(Field),

    #[error("a document already exists under the derived file name")]
    UploadConflict,

    #[error("object storage failure")]
    Storage(#[source] anyhow::Error),

    #[error("bookkeeping failed after upload")]
    Bookkeeping(#[source] anyhow::Error),
}

/// Error body returned by the HTTP API.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IngestError {
    fn status(&self) -> StatusCode {
        match self {
            IngestError::Unauthorized => StatusCode::FORBIDDEN,
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            IngestError::UploadConflict => StatusCode::CONFLICT,
            IngestError::Storage(_) => StatusCode::BAD_GATEWAY,
            IngestError::Bookkeeping(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            IngestError::Unauthorized => "UNAUTHORIZED",
            IngestError::NotFound(_) => "NOT_FOUND",
            IngestError::InvalidInput(_) => "INVALID_INPUT",
            IngestError::UploadConflict => "UPLOAD_CONFLICT",
            IngestError::Storage(_) => "STORAGE_ERROR",
            IngestError::Bookkeeping(_) => "BOOKKEEPING_ERROR",
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };

        (self.status(), Json(body)).into_response()
    }
}
