//! Outbox (pending change queue) models

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::{ClientId, EntityKind, Fields};

/// The remote operation a queued change will perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Result of folding a new operation into an already queued one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesced {
    /// Keep a single entry with this operation
    Keep(Operation),
    /// Nothing needs to reach the remote service any more
    Drop,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Fold `incoming` into an entry already queued as `existing`.
    ///
    /// A queued create stays a create until it has been pushed, and a create
    /// followed by a delete never has to reach the remote service at all.
    pub const fn coalesce(existing: Self, incoming: Self) -> Coalesced {
        match (existing, incoming) {
            (Self::Create, Self::Delete) => Coalesced::Drop,
            (Self::Create, _) => Coalesced::Keep(Self::Create),
            (_, Self::Delete) => Coalesced::Keep(Self::Delete),
            (Self::Update | Self::Delete, _) => Coalesced::Keep(Self::Update),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown outbox operation: {other}")),
        }
    }
}

/// A queued local mutation awaiting transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub entity_type: EntityKind,
    pub client_id: ClientId,
    pub remote_id: Option<String>,
    pub operation: Operation,
    pub payload: Fields,
    pub changed_fields: BTreeSet<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Oldest enqueue time; preserved across coalescing
    pub pending_since: i64,
    /// Bumped on every coalesce
    pub revision: i64,
    pub updated_at: i64,
}

impl OutboxEntry {
    /// A delete, or an entry with fields still to push.
    pub fn has_work(&self) -> bool {
        self.operation == Operation::Delete || !self.changed_fields.is_empty()
    }
}

/// A local mutation to fold into the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub entity_type: EntityKind,
    pub client_id: ClientId,
    pub remote_id: Option<String>,
    pub operation: Operation,
    pub payload: Fields,
    pub changed_fields: BTreeSet<String>,
}

/// An outbox entry given up on after too many failed attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub entity_type: EntityKind,
    pub client_id: String,
    pub operation: Operation,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub abandoned_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_absorbs_updates() {
        assert_eq!(
            Operation::coalesce(Operation::Create, Operation::Update),
            Coalesced::Keep(Operation::Create)
        );
    }

    #[test]
    fn create_then_delete_drops_entry() {
        assert_eq!(
            Operation::coalesce(Operation::Create, Operation::Delete),
            Coalesced::Drop
        );
    }

    #[test]
    fn delete_wins_over_update_and_restore_reverts_to_update() {
        assert_eq!(
            Operation::coalesce(Operation::Update, Operation::Delete),
            Coalesced::Keep(Operation::Delete)
        );
        assert_eq!(
            Operation::coalesce(Operation::Delete, Operation::Update),
            Coalesced::Keep(Operation::Update)
        );
    }
}
