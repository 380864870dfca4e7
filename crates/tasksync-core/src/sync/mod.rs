//! Sync engine: outbox push, partitioned bulk import, incremental pull and
//! the orchestrator that schedules them.

mod context;
mod importer;
mod orchestrator;
mod pull;
mod push;

#[cfg(test)]
mod tests;

pub use context::SyncContext;
pub use importer::{run_slice, window_filter, ImportReport, IMPORT_WINDOWS};
pub use orchestrator::{SyncOrchestrator, TickReport};
pub use pull::{pull_all, PullReport};
pub use push::{push_outbox, PushReport};
