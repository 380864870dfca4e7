//! tasksync-core - Core library for tasksync
//!
//! A local-first store of tasks, projects, time entries and notes kept in
//! sync with a rate-limited remote task service. Local edits land in SQLite
//! together with an outbox entry; the sync orchestrator pushes the outbox,
//! runs the partitioned bulk import and then pulls incremental changes,
//! resolving conflicts per field.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{ClientId, EntityKind, SyncRecord};
