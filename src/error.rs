//! Error taxonomy for the comparable-property engine

use thiserror::Error;

/// Errors surfaced by normalization, scoring and the engine context.
///
/// Per-record `Data` errors are absorbed by the pipeline and counted;
/// everything else propagates to the caller.
#[derive(Error, Debug)]
pub enum CompError {
    #[error("data error for record {record}: {reason}")]
    Data { record: String, reason: String },

    #[error("invalid query: {0}")]
    Configuration(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("dataset unavailable: {0}")]
    DatasetUnavailable(String),

    #[error("request exceeded time budget of {0} ms")]
    Timeout(u64),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl CompError {
    pub fn data(record: impl Into<String>, reason: impl Into<String>) -> Self {
        CompError::Data {
            record: record.into(),
            reason: reason.into(),
        }
    }

    /// True for errors the caller caused with bad query parameters
    pub fn is_validation(&self) -> bool {
        matches!(self, CompError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, CompError>;
