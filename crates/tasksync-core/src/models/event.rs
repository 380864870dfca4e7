//! Record change notifications for the presentation layer

use serde::Serialize;

use super::{ClientId, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordChange {
    Created,
    Updated,
    Trashed,
    Restored,
    Purged,
    /// Remote data was applied
    Pulled,
    /// The remote service acknowledged a queued change
    Pushed,
    /// A push failed in a way the user should see
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordEvent {
    pub kind: EntityKind,
    pub client_id: ClientId,
    pub change: RecordChange,
}
