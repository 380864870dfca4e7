use std::io;

use tasksync_core::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tasksync_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No fields provided")]
    EmptyFields,
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("{kind} not found for id/prefix: {query}")]
    RecordNotFound { kind: String, query: String },
    #[error("{0}")]
    AmbiguousRecordId(String),
    #[error("Edited fields must be a JSON object")]
    InvalidEditedFields,
    #[error("Editor command failed: {0}")]
    EditorFailed(String),
    #[error(
        "Sync is not configured. Set TASKSYNC_API_BASE_URL and TASKSYNC_API_TOKEN (a .env file works too)."
    )]
    SyncNotConfigured,
}
