//! Database layer for tasksync

mod conflict_repository;
mod connection;
mod migrations;
mod outbox_repository;
mod record_repository;
mod sync_state_repository;

pub use conflict_repository::{SqliteConflictRepository, FIELD_LWW};
pub use connection::Database;
pub use outbox_repository::SqliteOutboxRepository;
pub use record_repository::{
    RecordRepository, SqliteRecordRepository, UpsertOutcome, REMOTE_DELETED,
};
pub use sync_state_repository::SqliteSyncStateRepository;

