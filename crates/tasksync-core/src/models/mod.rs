//! Data models for tasksync

mod entity;
mod event;
mod outbox;
mod progress;
mod record;
mod sync_conflict;

pub use entity::{EntityKind, EntitySchema};
pub use event::{RecordChange, RecordEvent};
pub use outbox::{Coalesced, DeadLetter, Operation, OutboxEntry, PendingChange};
pub use progress::{ImportPhase, ImportProgress, PullCursor};
pub use record::{ClientId, FieldTimestamps, Fields, ListFilter, SyncRecord, SyncStatus};
pub use sync_conflict::SyncConflict;
