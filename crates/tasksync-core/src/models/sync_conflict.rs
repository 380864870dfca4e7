//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::EntityKind;

/// A field where a pending local edit won over an incoming remote value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    pub entity_type: EntityKind,
    /// Record involved in the conflict
    pub client_id: String,
    pub field: String,
    /// Local edit timestamp that won
    pub local_ts: i64,
    /// Incoming remote timestamp that was rejected
    pub remote_ts: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
}
