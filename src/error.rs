use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the mark engines and report pipeline.
///
/// Every variant maps to a stable wire code via [`MarksError::code`].
#[derive(Debug, Error)]
pub enum MarksError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    Conflict(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("render failed: {0}")]
    Render(String),

    #[error("report export exceeded {0:?}")]
    Timeout(Duration),
}

impl MarksError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            MarksError::Validation(_) => "validation_error",
            MarksError::NotFound(_) => "not_found",
            MarksError::Authorization(_) => "unauthorized",
            MarksError::Conflict(_) => "conflict",
            MarksError::Storage(StoreError::NotFound(_)) => "not_found",
            MarksError::Storage(_) => "storage_failed",
            MarksError::Render(_) => "render_failed",
            MarksError::Timeout(_) => "timeout",
        }
    }
}

impl From<std::io::Error> for MarksError {
    fn from(e: std::io::Error) -> Self {
        MarksError::Render(e.to_string())
    }
}

impl From<zip::result::ZipError> for MarksError {
    fn from(e: zip::result::ZipError) -> Self {
        MarksError::Render(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}
