use std::path::PathBuf;

use crate::types::FileId;

#[derive(Debug, thiserror::Error)]
pub enum IndexingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// One file-set provider failed; only its contribution is lost.
    #[error("provider {provider} failed: {reason}")]
    Provider { provider: String, reason: String },

    /// One file failed to index; it stays in the dirty file queue.
    #[error("failed to index file {file_id}: {reason}")]
    IndexWrite { file_id: FileId, reason: String },

    /// Persistent state is unreadable or inconsistent.
    #[error("storage corrupted ({storage}): {reason}")]
    StorageCorruption { storage: PathBuf, reason: String },

    #[error("index configuration changed: {0}")]
    ConfigIncompatibility(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IndexingError {
    /// Cooperative aborts are not failures and must not be logged as such.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_storage_corruption(&self) -> bool {
        matches!(self, Self::StorageCorruption { .. })
    }

    pub(crate) fn corruption(storage: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::StorageCorruption {
            storage: storage.into(),
            reason: reason.into(),
        }
    }
}

impl From<postcard::Error> for IndexingError {
    fn from(error: postcard::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<serde_json::Error> for IndexingError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IndexingError>;

/// Formats a panic payload caught by `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_string()
    }
}
