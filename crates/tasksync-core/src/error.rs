//! Error types for tasksync-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using tasksync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tasksync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote service error, classified at the adapter boundary
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Bulk import exhausted its retries and is paused until the next tick
    #[error("Import paused: {0}")]
    ImportPaused(RemoteError),
}

impl Error {
    /// The remote error behind this error, if any.
    pub const fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(error) | Self::ImportPaused(error) => Some(error),
            _ => None,
        }
    }
}
