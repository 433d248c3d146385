//! Error types for classif-ai
//!
//! Every failure maps onto a 4xx/5xx-equivalent status and a structured
//! body so an outer transport can surface it unchanged.

use serde::Serialize;
use thiserror::Error;

use crate::services::geometry::GeometryError;

/// Analysis and reconciliation error type
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request or failed business validation (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict with current state (409), e.g. queue entry already processed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Degenerate geometry reached the matcher (400)
    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),

    /// Internal error (500)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Predictor or other opaque collaborator failure (500)
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// classif-common error
    #[error("Common error: {0}")]
    Common(classif_common::Error),
}

impl From<classif_common::Error> for AnalysisError {
    fn from(err: classif_common::Error) -> Self {
        use classif_common::Error as E;
        match err {
            E::NotFound(msg) => AnalysisError::NotFound(msg),
            E::InvalidInput(msg) | E::Validation(msg) => AnalysisError::BadRequest(msg),
            E::Conflict(msg) => AnalysisError::Conflict(msg),
            other => AnalysisError::Common(other),
        }
    }
}

impl From<sqlx::Error> for AnalysisError {
    fn from(err: sqlx::Error) -> Self {
        AnalysisError::Common(classif_common::Error::Database(err))
    }
}

/// Structured error body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl AnalysisError {
    /// HTTP-equivalent status code
    pub fn status_code(&self) -> u16 {
        match self {
            AnalysisError::NotFound(_) => 404,
            AnalysisError::BadRequest(_) | AnalysisError::Geometry(_) => 400,
            AnalysisError::Conflict(_) => 409,
            AnalysisError::Internal(_) | AnalysisError::Other(_) | AnalysisError::Common(_) => 500,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let code = match self {
            AnalysisError::NotFound(_) => "NOT_FOUND",
            AnalysisError::BadRequest(_) => "BAD_REQUEST",
            AnalysisError::Conflict(_) => "CONFLICT",
            AnalysisError::Geometry(_) => "INVALID_GEOMETRY",
            AnalysisError::Internal(_) | AnalysisError::Other(_) => "INTERNAL_ERROR",
            AnalysisError::Common(_) => "COMMON_ERROR",
        };
        ErrorBody {
            code,
            message: self.to_string(),
        }
    }
}

/// Result type for analysis operations
pub type AnalysisResult<T> = Result<T, AnalysisError>;
