//! Record repository, written once against [`EntitySchema`].
//!
//! Every mutation writes the record row and its outbox entry in a single
//! transaction. Field timestamps decide merges: a field's local timestamp
//! only moves on local edits, its remote timestamp only when a remote value
//! for it is accepted.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use std::collections::BTreeSet;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use super::{SqliteConflictRepository, SqliteOutboxRepository};
use crate::error::{Error, Result};
use crate::models::{
    ClientId, EntityKind, EntitySchema, FieldTimestamps, Fields, ListFilter, Operation,
    OutboxEntry, PendingChange, SyncRecord, SyncStatus,
};
use crate::remote::{RemoteError, RemoteRecord};
use crate::util::{normalize_text_option, value_as_epoch_ms};

const RECORD_COLUMNS: &str = "client_id, remote_id, unique_external_id, fields, sync_status, \
     last_modified_local, last_modified_remote, field_local_timestamps, field_remote_timestamps, \
     sync_error, created_at, updated_at";

/// Shown on records the remote service no longer has.
pub const REMOTE_DELETED: &str = "Deleted on the remote service";

/// What applying one remote record did locally.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Inserted(SyncRecord),
    Updated {
        record: SyncRecord,
        /// Fields where a pending local edit was kept
        local_wins: Vec<String>,
    },
    Unchanged(SyncRecord),
    /// The remote record is archived; the local copy was trashed
    Trashed(SyncRecord),
    /// Nothing to apply (unknown archived record, or a local delete is pending)
    Ignored,
}

impl UpsertOutcome {
    pub const fn record(&self) -> Option<&SyncRecord> {
        match self {
            Self::Inserted(record)
            | Self::Updated { record, .. }
            | Self::Unchanged(record)
            | Self::Trashed(record) => Some(record),
            Self::Ignored => None,
        }
    }

    /// Whether local state changed.
    pub const fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Inserted(_) | Self::Updated { .. } | Self::Trashed(_)
        )
    }
}

/// Trait for record storage operations
pub trait RecordRepository {
    /// Create a never-pushed record and queue its creation
    fn create(&self, fields: Fields, now: i64) -> Result<SyncRecord>;

    /// Get a record by client ID
    fn get(&self, client_id: &ClientId) -> Result<Option<SyncRecord>>;

    /// Resolve `id` as a client ID, then a remote ID, then a unique external ID
    fn find(&self, id: &str) -> Result<Option<SyncRecord>>;

    /// Apply a local partial edit and queue it
    fn update(&self, id: &str, patch: &Fields, now: i64) -> Result<SyncRecord>;

    /// Merge a record fetched from the remote service
    fn upsert_remote(&self, remote: &RemoteRecord, now: i64) -> Result<UpsertOutcome>;

    /// Soft delete a record and queue the remote delete
    fn mark_trashed(&self, id: &str, now: i64) -> Result<SyncRecord>;

    /// Undo a soft delete, queueing whatever the remote side is missing
    fn restore(&self, id: &str, now: i64) -> Result<SyncRecord>;

    /// Permanently remove a trashed record
    fn purge(&self, id: &str) -> Result<()>;

    /// List records, newest edit first
    fn list(&self, filter: &ListFilter) -> Result<Vec<SyncRecord>>;

    /// The remote service accepted a create or update
    fn acknowledge_push(
        &self,
        entry: &OutboxEntry,
        remote: &RemoteRecord,
        now: i64,
    ) -> Result<Option<SyncRecord>>;

    /// The remote service accepted a delete
    fn acknowledge_delete(&self, entry: &OutboxEntry, now: i64) -> Result<Option<SyncRecord>>;

    /// The remote record behind `entry` no longer exists
    fn mark_remote_missing(&self, entry: &OutboxEntry, now: i64) -> Result<Option<SyncRecord>>;

    /// A push attempt failed without reaching a verdict on the record
    fn record_push_failure(
        &self,
        entry: &OutboxEntry,
        error: &RemoteError,
        counts: bool,
        now: i64,
    ) -> Result<()>;

    /// The entry was given up on; surface that on the record
    fn record_abandoned(&self, entry: &OutboxEntry, now: i64) -> Result<()>;
}

/// `SQLite` implementation of `RecordRepository`
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
    schema: &'static EntitySchema,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a repository for `kind` with the given connection
    pub const fn new(conn: &'a Connection, kind: EntityKind) -> Self {
        Self {
            conn,
            schema: kind.schema(),
        }
    }

    const fn kind(&self) -> EntityKind {
        self.schema.kind
    }

    fn outbox(&self) -> SqliteOutboxRepository<'a> {
        SqliteOutboxRepository::new(self.conn)
    }

    fn require(&self, id: &str) -> Result<SyncRecord> {
        self.find(id)?
            .ok_or_else(|| Error::NotFound(format!("{} {id}", self.kind())))
    }

    fn find_by(&self, column: &str, value: &str) -> Result<Option<SyncRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE {column} = ?1",
            self.schema.table
        );
        let row = self
            .conn
            .query_row(&sql, params![value], read_row)
            .optional()?;
        row.map(|raw| self.parse_record(raw)).transpose()
    }

    fn save(&self, record: &SyncRecord) -> Result<()> {
        let keys = IndexKeys::extract(self.schema, &record.fields);
        let sql = format!(
            "INSERT INTO {} ({RECORD_COLUMNS}, status_key, date_key, flag_key, relation_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(client_id) DO UPDATE SET
                remote_id = excluded.remote_id,
                unique_external_id = excluded.unique_external_id,
                fields = excluded.fields,
                sync_status = excluded.sync_status,
                last_modified_local = excluded.last_modified_local,
                last_modified_remote = excluded.last_modified_remote,
                field_local_timestamps = excluded.field_local_timestamps,
                field_remote_timestamps = excluded.field_remote_timestamps,
                sync_error = excluded.sync_error,
                updated_at = excluded.updated_at,
                status_key = excluded.status_key,
                date_key = excluded.date_key,
                flag_key = excluded.flag_key,
                relation_key = excluded.relation_key",
            self.schema.table
        );
        self.conn.execute(
            &sql,
            params![
                record.client_id.as_str(),
                record.remote_id,
                record.unique_external_id,
                serde_json::to_string(&record.fields)?,
                record.sync_status.as_str(),
                record.last_modified_local,
                record.last_modified_remote,
                serde_json::to_string(&record.field_local_timestamps)?,
                serde_json::to_string(&record.field_remote_timestamps)?,
                record.sync_error,
                record.created_at,
                record.updated_at,
                keys.status,
                keys.date,
                keys.flag,
                keys.relation,
            ],
        )?;
        Ok(())
    }

    fn delete_row(&self, client_id: &ClientId) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE client_id = ?1", self.schema.table);
        self.conn.execute(&sql, params![client_id.as_str()])?;
        Ok(())
    }

    /// Drop another local row holding `remote_id`; it is a second copy of the
    /// same remote record.
    fn drop_duplicate(&self, keep: &ClientId, remote_id: &str) -> Result<()> {
        if let Some(duplicate) = self.find_by("remote_id", remote_id)? {
            if duplicate.client_id != *keep {
                tracing::warn!(
                    kind = %self.kind(),
                    client_id = %duplicate.client_id,
                    remote_id,
                    "Removing duplicate local copy of remote record"
                );
                self.delete_row(&duplicate.client_id)?;
                self.outbox()
                    .remove_for_record(self.kind(), &duplicate.client_id)?;
            }
        }
        Ok(())
    }

    fn queue(
        &self,
        record: &SyncRecord,
        operation: Operation,
        payload: Fields,
        now: i64,
    ) -> Result<Option<OutboxEntry>> {
        let changed_fields = payload.keys().cloned().collect();
        self.outbox().enqueue(
            PendingChange {
                entity_type: self.kind(),
                client_id: record.client_id,
                remote_id: record.remote_id.clone(),
                operation,
                payload,
                changed_fields,
            },
            now,
        )
    }

    /// Forget the remote identity and queue a fresh create of every field.
    fn requeue_as_create(&self, record: &mut SyncRecord, now: i64) -> Result<()> {
        let stamp = now.max(record.last_modified_local);
        record.remote_id = None;
        record.unique_external_id = None;
        record.field_remote_timestamps.clear();
        record.field_local_timestamps = record
            .fields
            .keys()
            .map(|name| (name.clone(), stamp))
            .collect();
        record.last_modified_local = stamp;
        record.sync_status = SyncStatus::Local;
        record.sync_error = None;
        record.updated_at = now;

        self.outbox().remove_for_record(self.kind(), &record.client_id)?;
        self.queue(record, Operation::Create, record.fields.clone(), now)?;
        Ok(())
    }

    fn insert_remote(&self, remote: &RemoteRecord, now: i64) -> Result<UpsertOutcome> {
        let field_remote_timestamps: FieldTimestamps = remote
            .fields
            .keys()
            .map(|name| (name.clone(), remote.last_edited))
            .collect();
        let record = SyncRecord {
            remote_id: Some(remote.remote_id.clone()),
            unique_external_id: normalize_text_option(remote.unique_external_id.clone()),
            sync_status: SyncStatus::Synced,
            last_modified_local: 0,
            last_modified_remote: remote.last_edited,
            field_local_timestamps: FieldTimestamps::new(),
            field_remote_timestamps,
            ..SyncRecord::new_local(self.kind(), remote.fields.clone(), now)
        };
        self.save(&record)?;
        Ok(UpsertOutcome::Inserted(record))
    }

    fn merge_remote(&self, remote: &RemoteRecord, now: i64) -> Result<UpsertOutcome> {
        let unique_external_id = normalize_text_option(remote.unique_external_id.clone());
        let by_external_id = match unique_external_id.as_deref() {
            Some(external_id) => self.find_by("unique_external_id", external_id)?,
            None => None,
        };
        let existing = match by_external_id {
            Some(record) => {
                self.drop_duplicate(&record.client_id, &remote.remote_id)?;
                Some(record)
            }
            None => self.find_by("remote_id", &remote.remote_id)?,
        };

        let Some(mut record) = existing else {
            if remote.archived {
                return Ok(UpsertOutcome::Ignored);
            }
            return self.insert_remote(remote, now);
        };

        if record.is_trashed() {
            tracing::debug!(
                kind = %self.kind(),
                client_id = %record.client_id,
                "Ignoring remote data for locally trashed record"
            );
            return Ok(UpsertOutcome::Ignored);
        }

        let outbox = self.outbox();
        if remote.archived {
            outbox.remove_for_record(self.kind(), &record.client_id)?;
            record.remote_id = None;
            record.unique_external_id = None;
            record.sync_status = SyncStatus::Trashed;
            record.sync_error = Some(REMOTE_DELETED.to_string());
            record.last_modified_remote = record.last_modified_remote.max(remote.last_edited);
            record.updated_at = now;
            self.save(&record)?;
            return Ok(UpsertOutcome::Trashed(record));
        }

        let mut entry = outbox.get_for_record(self.kind(), &record.client_id)?;
        let queued = entry
            .as_ref()
            .map(|entry| entry.changed_fields.clone())
            .unwrap_or_default();
        let conflicts = SqliteConflictRepository::new(self.conn);

        let mut changed = false;
        let mut lost = BTreeSet::new();
        let mut local_wins = Vec::new();
        for (name, value) in &remote.fields {
            let previous_remote = record.field_remote_timestamps.get(name).copied();
            if previous_remote.is_some_and(|previous| remote.last_edited < previous) {
                continue;
            }

            let local_ts = record.field_local_timestamps.get(name).copied();
            let pending_local = queued.contains(name)
                && local_ts.is_some_and(|local| previous_remote.map_or(true, |prev| local > prev));
            if pending_local {
                if record.fields.get(name) != Some(value) {
                    conflicts.log(
                        self.kind(),
                        &record.client_id,
                        name,
                        local_ts.unwrap_or_default(),
                        remote.last_edited,
                        now,
                    )?;
                    local_wins.push(name.clone());
                }
                continue;
            }

            if queued.contains(name) {
                lost.insert(name.clone());
            }
            if record.fields.get(name) != Some(value) {
                record.fields.insert(name.clone(), value.clone());
                changed = true;
            }
            if previous_remote != Some(remote.last_edited) {
                record
                    .field_remote_timestamps
                    .insert(name.clone(), remote.last_edited);
                changed = true;
            }
        }

        if record.remote_id.as_deref() != Some(remote.remote_id.as_str()) {
            record.remote_id = Some(remote.remote_id.clone());
            changed = true;
        }
        if unique_external_id.is_some() && record.unique_external_id != unique_external_id {
            record.unique_external_id = unique_external_id;
            changed = true;
        }
        if remote.last_edited > record.last_modified_remote {
            record.last_modified_remote = remote.last_edited;
            changed = true;
        }

        if let Some(mut pending) = entry.take() {
            let mut touched = false;
            for name in &lost {
                pending.changed_fields.remove(name);
                pending.payload.remove(name);
                touched = true;
            }
            if pending.operation == Operation::Create {
                // Matched by external id: the record already exists remotely
                pending.operation = Operation::Update;
                touched = true;
            }
            if pending.remote_id != record.remote_id {
                pending.remote_id.clone_from(&record.remote_id);
                touched = true;
            }

            if !touched {
                entry = Some(pending);
            } else if pending.has_work() {
                pending.revision += 1;
                pending.updated_at = now;
                outbox.save(&pending)?;
                entry = Some(pending);
            } else {
                outbox.complete(pending.id)?;
            }
        }

        let status = if entry.is_some() {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };
        if record.sync_status != status {
            record.sync_status = status;
            changed = true;
        }
        if status == SyncStatus::Synced && record.sync_error.is_some() {
            record.sync_error = None;
            changed = true;
        }

        if !local_wins.is_empty() {
            tracing::debug!(
                kind = %self.kind(),
                client_id = %record.client_id,
                fields = ?local_wins,
                "Kept pending local edits over remote values"
            );
        }

        if !changed {
            return Ok(UpsertOutcome::Unchanged(record));
        }
        record.updated_at = now;
        self.save(&record)?;
        Ok(UpsertOutcome::Updated { record, local_wins })
    }

    fn parse_record(&self, raw: RawRecord) -> Result<SyncRecord> {
        Ok(SyncRecord {
            kind: self.kind(),
            client_id: raw
                .client_id
                .parse()
                .map_err(|_| Error::InvalidInput(format!("Invalid client ID: {}", raw.client_id)))?,
            remote_id: raw.remote_id,
            unique_external_id: raw.unique_external_id,
            fields: serde_json::from_str(&raw.fields)?,
            sync_status: raw.sync_status.parse().map_err(Error::InvalidInput)?,
            last_modified_local: raw.last_modified_local,
            last_modified_remote: raw.last_modified_remote,
            field_local_timestamps: serde_json::from_str(&raw.field_local_timestamps)?,
            field_remote_timestamps: serde_json::from_str(&raw.field_remote_timestamps)?,
            sync_error: raw.sync_error,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn create(&self, fields: Fields, now: i64) -> Result<SyncRecord> {
        if fields.is_empty() {
            return Err(Error::InvalidInput("record has no fields".into()));
        }

        let record = SyncRecord::new_local(self.kind(), fields, now);
        let tx = self.conn.unchecked_transaction()?;
        let repo = SqliteRecordRepository::new(&tx, self.kind());
        repo.save(&record)?;
        repo.queue(&record, Operation::Create, record.fields.clone(), now)?;
        tx.commit()?;

        tracing::debug!(kind = %self.kind(), client_id = %record.client_id, "Created record");
        Ok(record)
    }

    fn get(&self, client_id: &ClientId) -> Result<Option<SyncRecord>> {
        self.find_by("client_id", &client_id.as_str())
    }

    fn find(&self, id: &str) -> Result<Option<SyncRecord>> {
        let id = id.trim();
        if let Ok(client_id) = id.parse::<ClientId>() {
            if let Some(record) = self.get(&client_id)? {
                return Ok(Some(record));
            }
        }
        if let Some(record) = self.find_by("remote_id", id)? {
            return Ok(Some(record));
        }
        self.find_by("unique_external_id", id)
    }

    fn update(&self, id: &str, patch: &Fields, now: i64) -> Result<SyncRecord> {
        if patch.is_empty() {
            return Err(Error::InvalidInput("nothing to update".into()));
        }
        let mut record = self.require(id)?;
        if record.is_trashed() {
            return Err(Error::InvalidInput(format!(
                "{} {} is trashed; restore it first",
                self.kind(),
                record.client_id
            )));
        }

        let changed = record.apply_local(patch, now);
        record.sync_status = if record.remote_id.is_some() {
            SyncStatus::Pending
        } else {
            SyncStatus::Local
        };
        record.sync_error = None;

        let tx = self.conn.unchecked_transaction()?;
        let repo = SqliteRecordRepository::new(&tx, self.kind());
        repo.save(&record)?;
        repo.queue(&record, Operation::Update, record.select_fields(&changed), now)?;
        tx.commit()?;
        Ok(record)
    }

    fn upsert_remote(&self, remote: &RemoteRecord, now: i64) -> Result<UpsertOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let outcome = SqliteRecordRepository::new(&tx, self.kind()).merge_remote(remote, now)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn mark_trashed(&self, id: &str, now: i64) -> Result<SyncRecord> {
        let mut record = self.require(id)?;
        if record.is_trashed() {
            return Ok(record);
        }
        record.sync_status = SyncStatus::Trashed;
        record.updated_at = now;

        let tx = self.conn.unchecked_transaction()?;
        let repo = SqliteRecordRepository::new(&tx, self.kind());
        repo.save(&record)?;
        repo.queue(&record, Operation::Delete, Fields::new(), now)?;
        tx.commit()?;
        Ok(record)
    }

    fn restore(&self, id: &str, now: i64) -> Result<SyncRecord> {
        let mut record = self.require(id)?;
        if !record.is_trashed() {
            return Ok(record);
        }

        let tx = self.conn.unchecked_transaction()?;
        let repo = SqliteRecordRepository::new(&tx, self.kind());
        if record.remote_id.is_none() {
            repo.requeue_as_create(&mut record, now)?;
        } else {
            record.sync_error = None;
            record.updated_at = now;
            let newer = record.locally_newer_fields();
            if newer.is_empty() {
                repo.outbox().remove_for_record(self.kind(), &record.client_id)?;
                record.sync_status = SyncStatus::Synced;
            } else {
                repo.queue(&record, Operation::Update, record.select_fields(&newer), now)?;
                record.sync_status = SyncStatus::Pending;
            }
        }
        repo.save(&record)?;
        tx.commit()?;
        Ok(record)
    }

    fn purge(&self, id: &str) -> Result<()> {
        let record = self.require(id)?;
        if !record.is_trashed() {
            return Err(Error::InvalidInput(format!(
                "{} {} must be trashed before it is purged",
                self.kind(),
                record.client_id
            )));
        }

        let tx = self.conn.unchecked_transaction()?;
        let repo = SqliteRecordRepository::new(&tx, self.kind());
        repo.delete_row(&record.client_id)?;
        // A queued remote delete still has to go out
        let outbox = repo.outbox();
        if let Some(entry) = outbox.get_for_record(self.kind(), &record.client_id)? {
            if entry.operation != Operation::Delete {
                outbox.complete(entry.id)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn list(&self, filter: &ListFilter) -> Result<Vec<SyncRecord>> {
        let mut sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE 1 = 1",
            self.schema.table
        );
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(status) = filter.sync_status {
            sql.push_str(" AND sync_status = ?");
            values.push(SqlValue::Text(status.as_str().to_string()));
        } else if !filter.include_trashed {
            sql.push_str(" AND sync_status != 'trashed'");
        }
        if let Some(status) = &filter.status {
            sql.push_str(" AND status_key = ?");
            values.push(SqlValue::Text(status.clone()));
        }
        if let Some(from) = filter.date_from {
            sql.push_str(" AND date_key >= ?");
            values.push(SqlValue::Integer(from));
        }
        if let Some(to) = filter.date_to {
            sql.push_str(" AND date_key < ?");
            values.push(SqlValue::Integer(to));
        }
        if let Some(flag) = filter.flag {
            sql.push_str(" AND flag_key = ?");
            values.push(SqlValue::Integer(i64::from(flag)));
        }
        if let Some(related) = &filter.related_to {
            sql.push_str(" AND relation_key = ?");
            values.push(SqlValue::Text(related.clone()));
        }

        sql.push_str(" ORDER BY updated_at DESC, client_id ASC LIMIT ? OFFSET ?");
        // LIMIT -1 means no limit
        let limit = if filter.limit == 0 {
            -1
        } else {
            filter.limit as i64
        };
        values.push(SqlValue::Integer(limit));
        values.push(SqlValue::Integer(filter.offset as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(|raw| self.parse_record(raw)).collect()
    }

    fn acknowledge_push(
        &self,
        entry: &OutboxEntry,
        remote: &RemoteRecord,
        now: i64,
    ) -> Result<Option<SyncRecord>> {
        let tx = self.conn.unchecked_transaction()?;
        let repo = SqliteRecordRepository::new(&tx, self.kind());
        let outbox = repo.outbox();
        let completed = outbox.complete_if_revision(entry.id, entry.revision)?;

        let Some(mut record) = repo.get(&entry.client_id)? else {
            outbox.complete(entry.id)?;
            tx.commit()?;
            return Ok(None);
        };

        repo.drop_duplicate(&record.client_id, &remote.remote_id)?;
        record.remote_id = Some(remote.remote_id.clone());
        if let Some(external_id) = normalize_text_option(remote.unique_external_id.clone()) {
            record.unique_external_id = Some(external_id);
        }
        record.last_modified_remote = record.last_modified_remote.max(remote.last_edited);
        record.updated_at = now;

        if completed {
            for name in &entry.changed_fields {
                let local = record.field_local_timestamps.get(name).copied().unwrap_or(0);
                record
                    .field_remote_timestamps
                    .insert(name.clone(), remote.last_edited.max(local));
            }
            record.sync_error = None;
            if !record.is_trashed() {
                record.sync_status = SyncStatus::Synced;
            }
        } else if let Some(mut current) = outbox.get(entry.id)? {
            // Edits were folded in while the push was in flight
            if current.operation == Operation::Create {
                current.operation = Operation::Update;
            }
            current.remote_id.clone_from(&record.remote_id);
            outbox.save(&current)?;
            if !record.is_trashed() {
                record.sync_status = SyncStatus::Pending;
            }
        } else if record.is_trashed() {
            // Trashed before the create landed; the remote copy must go too
            repo.queue(&record, Operation::Delete, Fields::new(), now)?;
        }

        repo.save(&record)?;
        tx.commit()?;
        Ok(Some(record))
    }

    fn acknowledge_delete(&self, entry: &OutboxEntry, now: i64) -> Result<Option<SyncRecord>> {
        let tx = self.conn.unchecked_transaction()?;
        let repo = SqliteRecordRepository::new(&tx, self.kind());

        let Some(mut record) = repo.get(&entry.client_id)? else {
            repo.outbox().complete(entry.id)?;
            tx.commit()?;
            return Ok(None);
        };

        if record.is_trashed() {
            repo.outbox().complete(entry.id)?;
            record.remote_id = None;
            record.unique_external_id = None;
            record.updated_at = now;
        } else {
            // Restored while the delete was in flight; the remote copy is gone
            repo.requeue_as_create(&mut record, now)?;
        }
        repo.save(&record)?;
        tx.commit()?;
        Ok(Some(record))
    }

    fn mark_remote_missing(&self, entry: &OutboxEntry, now: i64) -> Result<Option<SyncRecord>> {
        let tx = self.conn.unchecked_transaction()?;
        let repo = SqliteRecordRepository::new(&tx, self.kind());
        repo.outbox().complete(entry.id)?;

        let Some(mut record) = repo.get(&entry.client_id)? else {
            tx.commit()?;
            return Ok(None);
        };
        record.remote_id = None;
        record.unique_external_id = None;
        record.sync_status = SyncStatus::Trashed;
        if entry.operation != Operation::Delete {
            record.sync_error = Some(REMOTE_DELETED.to_string());
        }
        record.updated_at = now;
        repo.save(&record)?;
        tx.commit()?;
        Ok(Some(record))
    }

    fn record_push_failure(
        &self,
        entry: &OutboxEntry,
        error: &RemoteError,
        counts: bool,
        now: i64,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let repo = SqliteRecordRepository::new(&tx, self.kind());
        repo.outbox().fail(entry.id, &error.to_string(), counts, now)?;
        if counts {
            if let Some(mut record) = repo.get(&entry.client_id)? {
                record.sync_error = Some(error.message.clone());
                repo.save(&record)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn record_abandoned(&self, entry: &OutboxEntry, now: i64) -> Result<()> {
        let Some(mut record) = self.get(&entry.client_id)? else {
            return Ok(());
        };
        let reason = entry.last_error.as_deref().unwrap_or("unknown error");
        record.sync_error = Some(format!(
            "Gave up on {} after {} attempts: {reason}",
            entry.operation, entry.retry_count
        ));
        record.updated_at = now;
        self.save(&record)
    }
}

/// Values copied out of the JSON fields into indexed columns.
struct IndexKeys {
    status: Option<String>,
    date: Option<i64>,
    flag: Option<bool>,
    relation: Option<String>,
}

impl IndexKeys {
    fn extract(schema: &EntitySchema, fields: &Fields) -> Self {
        let field = |name: Option<&str>| name.and_then(|name| fields.get(name));
        Self {
            status: field(schema.status_field)
                .and_then(Value::as_str)
                .map(str::to_string),
            date: field(schema.date_field).and_then(value_as_epoch_ms),
            flag: field(schema.flag_field).and_then(Value::as_bool),
            relation: field(schema.relation_field)
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// Column values before JSON and enum decoding.
struct RawRecord {
    client_id: String,
    remote_id: Option<String>,
    unique_external_id: Option<String>,
    fields: String,
    sync_status: String,
    last_modified_local: i64,
    last_modified_remote: i64,
    field_local_timestamps: String,
    field_remote_timestamps: String,
    sync_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        client_id: row.get(0)?,
        remote_id: row.get(1)?,
        unique_external_id: row.get(2)?,
        fields: row.get(3)?,
        sync_status: row.get(4)?,
        last_modified_local: row.get(5)?,
        last_modified_remote: row.get(6)?,
        field_local_timestamps: row.get(7)?,
        field_remote_timestamps: row.get(8)?,
        sync_error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}
