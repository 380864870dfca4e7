//! Sync status shared with the presentation layer.

use serde::Serialize;
use std::fmt;

/// Orchestrator state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    /// The last cycle hit a network or rate-limit failure; retried next tick
    Offline,
    Error,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable status snapshot broadcast after every transition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatusSnapshot {
    pub state: SyncState,
    /// Queued local changes, tracked in every state
    pub pending_items: usize,
    pub message: Option<String>,
    /// End of the last cycle that finished without any remote failure
    pub last_synced_at: Option<i64>,
}

impl SyncStatusSnapshot {
    /// One-line summary for people.
    pub fn summary(&self) -> String {
        match self.state {
            SyncState::Syncing => "Syncing".to_string(),
            SyncState::Offline => "Offline, will retry".to_string(),
            SyncState::Error => format!(
                "Error: {}",
                self.message.as_deref().unwrap_or("unknown error")
            ),
            SyncState::Idle if self.pending_items == 0 => "Everything synced".to_string(),
            SyncState::Idle if self.pending_items == 1 => "1 change pending".to_string(),
            SyncState::Idle => format!("{} changes pending", self.pending_items),
        }
    }
}
