//! Error types for the basalt storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("Write-write conflict: {0}")]
    WWConflict(String),

    #[error("Transaction not found: {0}")]
    TxnNotFound(u64),

    #[error("No appendable segment for table {0}")]
    AppendableSegmentNotFound(u64),

    #[error("Possible duplicate, exact probe required")]
    ExpectedPossibleDup,

    #[error("Flush timed out after {0:?}")]
    FlushTimeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// True for errors a caller may retry without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::FlushTimeout(_) | EngineError::Io(_))
    }
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<snap::Error> for EngineError {
    fn from(err: snap::Error) -> Self {
        EngineError::Corruption(format!("snappy: {}", err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
