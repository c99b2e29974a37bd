//! Storage-layer error types.

use thiserror::Error;

/// Errors from the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to send command to store worker")]
    ChannelSend,

    #[error("store worker terminated unexpectedly")]
    WorkerGone,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown enum value or out-of-range number in a row.
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("migration error: {0}")]
    Migration(String),
}

/// Errors from chunk persistence.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk file error at {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },

    #[error("chunk {0} already exists on disk")]
    AlreadySealed(String),

    #[error("failed to encode sample: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("malformed chunk line {line}: {message}")]
    Decode { line: usize, message: String },

    #[error("chunk {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("chunk writer is not running")]
    WriterClosed,
}

impl ChunkError {
    pub(crate) fn file(path: &std::path::Path, source: std::io::Error) -> Self {
        ChunkError::File {
            path: path.display().to_string(),
            source,
        }
    }

    /// Disk and database hiccups may clear up; bad data will not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChunkError::File { .. }
                | ChunkError::Store(StoreError::Database(_))
                | ChunkError::Store(StoreError::Io(_))
        )
    }
}
