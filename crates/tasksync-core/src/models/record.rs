//! Syncable record model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::EntityKind;

/// Entity attributes as a JSON object.
pub type Fields = Map<String, Value>;

/// Field name to epoch-millisecond timestamp.
pub type FieldTimestamps = BTreeMap<String, i64>;

/// A locally generated record identifier, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Create a new unique client ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a record stands relative to the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Never pushed; no remote identity yet
    Local,
    /// Has local edits the remote service has not acknowledged
    Pending,
    /// Matches the last known remote state
    Synced,
    /// Soft-deleted; hidden from normal listings
    Trashed,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Trashed => "trashed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "trashed" => Ok(Self::Trashed),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// A task, project, time entry or note with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub kind: EntityKind,
    /// Durable local primary key
    pub client_id: ClientId,
    /// Identifier assigned by the remote service on first push
    pub remote_id: Option<String>,
    /// Stable human-meaningful remote identifier (strongest dedup key)
    pub unique_external_id: Option<String>,
    pub fields: Fields,
    pub sync_status: SyncStatus,
    /// Last local change to any field (Unix ms)
    pub last_modified_local: i64,
    /// Last accepted remote change to any field (Unix ms)
    pub last_modified_remote: i64,
    pub field_local_timestamps: FieldTimestamps,
    pub field_remote_timestamps: FieldTimestamps,
    /// Persistent push failure surfaced to the UI layer
    pub sync_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SyncRecord {
    /// A fresh, never-pushed record.
    #[must_use]
    pub fn new_local(kind: EntityKind, fields: Fields, now: i64) -> Self {
        let field_local_timestamps = fields.keys().map(|name| (name.clone(), now)).collect();
        Self {
            kind,
            client_id: ClientId::new(),
            remote_id: None,
            unique_external_id: None,
            fields,
            sync_status: SyncStatus::Local,
            last_modified_local: now,
            last_modified_remote: 0,
            field_local_timestamps,
            field_remote_timestamps: FieldTimestamps::new(),
            sync_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Title text according to the kind's schema, if present.
    pub fn title(&self) -> Option<&str> {
        self.fields
            .get(self.kind.schema().title_field)
            .and_then(Value::as_str)
    }

    pub const fn is_trashed(&self) -> bool {
        matches!(self.sync_status, SyncStatus::Trashed)
    }

    /// Apply a local edit to the given fields, stamping each one.
    ///
    /// Returns the names of the fields that were written.
    pub fn apply_local(&mut self, patch: &Fields, now: i64) -> Vec<String> {
        let stamp = now.max(self.last_modified_local);
        let mut changed = Vec::with_capacity(patch.len());
        for (name, value) in patch {
            self.fields.insert(name.clone(), value.clone());
            self.field_local_timestamps.insert(name.clone(), stamp);
            changed.push(name.clone());
        }
        self.last_modified_local = stamp;
        self.updated_at = now;
        changed
    }

    /// Fields edited locally more recently than their last accepted remote value.
    pub fn locally_newer_fields(&self) -> Vec<String> {
        self.field_local_timestamps
            .iter()
            .filter(|(name, local_ts)| {
                self.field_remote_timestamps
                    .get(name.as_str())
                    .map_or(true, |remote_ts| *local_ts > remote_ts)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Copy of the named fields, skipping any the record doesn't have.
    pub fn select_fields<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Fields {
        names
            .into_iter()
            .filter_map(|name| {
                self.fields
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }
}

/// Filters for listing records; every filter is served by an index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub sync_status: Option<SyncStatus>,
    /// Matches the schema's status field
    pub status: Option<String>,
    /// Inclusive lower bound on the schema's date field (Unix ms)
    pub date_from: Option<i64>,
    /// Exclusive upper bound on the schema's date field (Unix ms)
    pub date_to: Option<i64>,
    pub flag: Option<bool>,
    /// Remote id of the related record
    pub related_to: Option<String>,
    pub include_trashed: bool,
    pub limit: usize,
    pub offset: usize,
}

impl ListFilter {
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_client_id_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
    }

    #[test]
    fn test_client_id_parse() {
        let id = ClientId::new();
        let parsed: ClientId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn new_local_stamps_every_field() {
        let record = SyncRecord::new_local(
            EntityKind::Task,
            fields(json!({"title": "Write report", "status": "todo"})),
            1_000,
        );
        assert_eq!(record.sync_status, SyncStatus::Local);
        assert_eq!(record.field_local_timestamps.get("title"), Some(&1_000));
        assert_eq!(record.field_local_timestamps.get("status"), Some(&1_000));
        assert!(record.field_remote_timestamps.is_empty());
        assert_eq!(record.title(), Some("Write report"));
    }

    #[test]
    fn apply_local_never_moves_timestamps_backwards() {
        let mut record =
            SyncRecord::new_local(EntityKind::Note, fields(json!({"title": "a"})), 5_000);
        record.apply_local(&fields(json!({"title": "b"})), 4_000);
        assert_eq!(record.last_modified_local, 5_000);
        assert_eq!(record.field_local_timestamps.get("title"), Some(&5_000));
        assert_eq!(record.fields.get("title"), Some(&json!("b")));
    }

    #[test]
    fn locally_newer_fields_compares_per_field() {
        let mut record = SyncRecord::new_local(
            EntityKind::Task,
            fields(json!({"title": "a", "status": "todo"})),
            2_000,
        );
        record.field_remote_timestamps.insert("title".into(), 3_000);
        record.field_remote_timestamps.insert("status".into(), 1_000);
        assert_eq!(record.locally_newer_fields(), vec!["status".to_string()]);
    }

    #[test]
    fn sync_status_round_trips_through_text() {
        for status in [
            SyncStatus::Local,
            SyncStatus::Pending,
            SyncStatus::Synced,
            SyncStatus::Trashed,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>(), Ok(status));
        }
    }
}
