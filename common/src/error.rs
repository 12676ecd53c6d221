use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Embedding quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Processing error: {0}")]
    Processing(String),
}

impl AppError {
    /// Quota exhaustion is the one failure no amount of backoff can fix; the
    /// indexing loop treats it as fatal while every other actor keeps running.
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, AppError::QuotaExhausted(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AppError::RateLimited(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }
}
