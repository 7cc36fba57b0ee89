//! Error types for cache snapshot persistence.

use thiserror::Error;

/// Errors that can occur while saving or loading an offline snapshot.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot JSON could not be encoded or decoded.
    #[error("Snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The snapshot path has no parent directory to stage the write in.
    #[error("Invalid snapshot path: {0}")]
    InvalidPath(String),
}
