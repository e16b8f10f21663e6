//! Error types for rag-memory

use thiserror::Error;

/// Result type alias for rag-memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in rag-memory
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    EmbeddingClient(#[from] EmbeddingClientError),

    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn index_unavailable(msg: impl Into<String>) -> Self {
        Self::IndexUnavailable(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether a worker may retry the operation that produced this error.
    ///
    /// Storage faults during a write are retried like transient embedding
    /// failures; bad input and permanent client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            // A constraint violation repeats on every attempt
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => e.code != rusqlite::ErrorCode::ConstraintViolation,
            Error::Storage(_) | Error::Io(_) => true,
            Error::EmbeddingClient(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Failures reported by an [`EmbeddingClient`](crate::embedding::EmbeddingClient)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingClientError {
    /// Timeouts, rate limits, connection resets. Worth another attempt.
    #[error("Transient embedding error: {0}")]
    Transient(String),

    /// Rejected input, bad credentials, unknown model. Retrying will not help.
    #[error("Permanent embedding error: {0}")]
    Permanent(String),
}

impl EmbeddingClientError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingClientError::Transient(_))
    }
}
