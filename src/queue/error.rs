use std::path::PathBuf;
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("insufficient disk space: {available} bytes available, {required} required")]
    DiskSpace { available: u64, required: u64 },

    #[error("failed to serialize item '{id}': {reason}")]
    Serialization { id: String, reason: String },

    #[error("unreadable metadata '{path}': {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for QueueError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InsufficientSpace {
                available,
                required,
            } => QueueError::DiskSpace {
                available,
                required,
            },
            StorageError::Io(io) => QueueError::Io(io),
            other => QueueError::Storage(other),
        }
    }
}

impl QueueError {
    /// Whether the operation may simply be retried on the next cycle
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::DiskSpace { .. } | QueueError::Io(_) => true,
            QueueError::Storage(err) => err.is_transient(),
            QueueError::Serialization { .. } | QueueError::Metadata { .. } => false,
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
