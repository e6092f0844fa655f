//! Error types for harvest-pipeline
//!
//! Severity follows the propagation policy of the pipeline:
//! - `FetchFailed` is per-entity and never escapes collection
//! - `TrainingFailed` aborts only the current weekly run
//! - `ArtifactCorrupt` means the deployed model is unusable and is alerted on
//! - `LeaseContention` means another promotion holds the store
//! - `ArtifactMissing` is surfaced to the rollback caller as-is

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::FetchErrorKind;

/// Pipeline error type
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Metrics fetch for one entity failed
    #[error("Fetch failed for {entity_id} ({kind}): {message}")]
    FetchFailed {
        entity_id: String,
        kind: FetchErrorKind,
        message: String,
    },

    /// Every attempted entity failed during collection
    #[error("Collection failed for all {attempted} entities")]
    CollectionFailed { attempted: usize },

    /// Trainer did not produce a usable candidate
    #[error("Training failed: {0}")]
    TrainingFailed(String),

    /// The current pointer references an unreadable artifact
    #[error("Artifact corrupt for version {version_id}: {reason}")]
    ArtifactCorrupt { version_id: u64, reason: String },

    /// Rollback target no longer has a readable artifact
    #[error("Artifact missing for version {0}")]
    ArtifactMissing(u64),

    /// Another promotion holds the lease
    #[error("Lease contention: {0}")]
    LeaseContention(String),

    /// The run was cancelled between states
    #[error("Run cancelled")]
    Cancelled,

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// harvest-common error
    #[error(transparent)]
    Common(#[from] harvest_common::Error),
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Common(harvest_common::Error::Database(err))
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Pipeline error
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Pipeline(ref err) => match err {
                PipelineError::ArtifactMissing(_) => {
                    (StatusCode::NOT_FOUND, "ARTIFACT_MISSING", err.to_string())
                }
                PipelineError::LeaseContention(_) => {
                    (StatusCode::CONFLICT, "LEASE_CONTENTION", err.to_string())
                }
                PipelineError::ArtifactCorrupt { .. } => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ARTIFACT_CORRUPT",
                    err.to_string(),
                ),
                PipelineError::Common(harvest_common::Error::NotFound(_)) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
                }
                PipelineError::Common(harvest_common::Error::InvalidInput(_)) => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST", err.to_string())
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "PIPELINE_ERROR",
                    err.to_string(),
                ),
            },
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
