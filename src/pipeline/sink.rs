//! Downstream seam shared by streams, buffers and the batch saver.

use crate::sensor::types::Sample;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a [`BatchSink`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Disk or network hiccup; the same batch may succeed later.
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// The sink refused the batch itself (malformed, too large, ...).
    #[error("sink rejected batch: {0}")]
    Rejected(String),

    #[error("sink closed")]
    Closed,
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Receives ordered samples. Each sample carries its own sensor kind.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn write(&self, samples: Vec<Sample>) -> Result<(), SinkError>;
}

pub type SharedSink = Arc<dyn BatchSink>;
