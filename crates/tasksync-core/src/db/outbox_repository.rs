//! Outbox (pending change queue) repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT and counters

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{
    ClientId, Coalesced, DeadLetter, EntityKind, Fields, Operation, OutboxEntry, PendingChange,
};

const ENTRY_COLUMNS: &str = "id, entity_type, client_id, remote_id, operation, payload, \
     changed_fields, retry_count, last_error, pending_since, revision, updated_at";

/// Durable, coalescing queue of local mutations.
///
/// There is at most one entry per `(entity_type, client_id)`. Callers that
/// change a record and its entry together pass a transaction as the
/// connection; no method here opens a transaction of its own except
/// [`SqliteOutboxRepository::purge_stuck`].
pub struct SqliteOutboxRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteOutboxRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Queue `change`, folding it into an existing entry for the same record.
    ///
    /// Returns the resulting entry, or `None` when the change cancelled the
    /// queued work entirely (a create followed by a delete).
    pub fn enqueue(&self, change: PendingChange, now: i64) -> Result<Option<OutboxEntry>> {
        let Some(mut entry) = self.get_for_record(change.entity_type, &change.client_id)? else {
            if change.operation == Operation::Delete && change.remote_id.is_none() {
                return Ok(None);
            }
            return self.insert(change, now).map(Some);
        };

        match Operation::coalesce(entry.operation, change.operation) {
            Coalesced::Drop => {
                self.complete(entry.id)?;
                tracing::debug!(
                    kind = %entry.entity_type,
                    client_id = %entry.client_id,
                    "Queued create cancelled by delete"
                );
                Ok(None)
            }
            Coalesced::Keep(operation) => {
                entry.operation = operation;
                entry.payload.extend(change.payload);
                entry.changed_fields.extend(change.changed_fields);
                if change.remote_id.is_some() {
                    entry.remote_id = change.remote_id;
                }
                entry.retry_count = 0;
                entry.last_error = None;
                entry.revision += 1;
                entry.updated_at = now;
                self.save(&entry)?;
                Ok(Some(entry))
            }
        }
    }

    fn insert(&self, change: PendingChange, now: i64) -> Result<OutboxEntry> {
        self.conn.execute(
            "INSERT INTO outbox (entity_type, client_id, remote_id, operation, payload,
                changed_fields, retry_count, last_error, pending_since, revision, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL, ?7, 1, ?7)",
            params![
                change.entity_type.as_str(),
                change.client_id.as_str(),
                change.remote_id,
                change.operation.as_str(),
                serde_json::to_string(&change.payload)?,
                serde_json::to_string(&change.changed_fields)?,
                now,
            ],
        )?;

        Ok(OutboxEntry {
            id: self.conn.last_insert_rowid(),
            entity_type: change.entity_type,
            client_id: change.client_id,
            remote_id: change.remote_id,
            operation: change.operation,
            payload: change.payload,
            changed_fields: change.changed_fields,
            retry_count: 0,
            last_error: None,
            pending_since: now,
            revision: 1,
            updated_at: now,
        })
    }

    /// Write back an entry's operation, payload, fields and revision.
    pub fn save(&self, entry: &OutboxEntry) -> Result<()> {
        self.conn.execute(
            "UPDATE outbox
             SET remote_id = ?2, operation = ?3, payload = ?4, changed_fields = ?5,
                 retry_count = ?6, last_error = ?7, revision = ?8, updated_at = ?9
             WHERE id = ?1",
            params![
                entry.id,
                entry.remote_id,
                entry.operation.as_str(),
                serde_json::to_string(&entry.payload)?,
                serde_json::to_string(&entry.changed_fields)?,
                entry.retry_count,
                entry.last_error,
                entry.revision,
                entry.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<OutboxEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], Self::read_row)
            .optional()?;
        row.map(Self::parse_entry).transpose()
    }

    pub fn get_for_record(
        &self,
        entity_type: EntityKind,
        client_id: &ClientId,
    ) -> Result<Option<OutboxEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox WHERE entity_type = ?1 AND client_id = ?2"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![entity_type.as_str(), client_id.as_str()],
                Self::read_row,
            )
            .optional()?;
        row.map(Self::parse_entry).transpose()
    }

    /// Oldest entries first, strictly after the `(pending_since, id)` key.
    pub fn drain(&self, limit: usize, after: Option<(i64, i64)>) -> Result<Vec<OutboxEntry>> {
        let (since, id) = after.unwrap_or((i64::MIN, i64::MIN));
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE (pending_since, id) > (?1, ?2)
             ORDER BY pending_since ASC, id ASC
             LIMIT ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![since, id, limit as i64], Self::read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(Self::parse_entry).collect()
    }

    /// Remove an entry after the remote service accepted it.
    pub fn complete(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Remove an entry only if nothing was folded into it since `revision`.
    pub fn complete_if_revision(&self, id: i64, revision: i64) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM outbox WHERE id = ?1 AND revision = ?2",
            params![id, revision],
        )?;
        Ok(removed > 0)
    }

    pub fn remove_for_record(&self, entity_type: EntityKind, client_id: &ClientId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM outbox WHERE entity_type = ?1 AND client_id = ?2",
            params![entity_type.as_str(), client_id.as_str()],
        )?;
        Ok(())
    }

    /// Record a failed attempt. Only failures about the record itself count
    /// toward the stuck threshold.
    pub fn fail(&self, id: i64, error: &str, counts: bool, now: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE outbox
             SET last_error = ?2, retry_count = retry_count + ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, error, i64::from(counts), now],
        )?;
        Ok(())
    }

    /// Move entries that failed `threshold` times or more to the dead-letter
    /// table and return them.
    ///
    /// Runs on the caller's transaction so the records can be marked in the
    /// same commit.
    pub fn purge_stuck(&self, threshold: u32, now: i64) -> Result<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox WHERE retry_count >= ?1 ORDER BY id ASC"
        );
        let rows = {
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![threshold], Self::read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let stuck = rows
            .into_iter()
            .map(Self::parse_entry)
            .collect::<Result<Vec<_>>>()?;

        for entry in &stuck {
            self.conn.execute(
                "INSERT INTO outbox_dead_letters (entity_type, client_id, remote_id, operation,
                    payload, retry_count, last_error, abandoned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.entity_type.as_str(),
                    entry.client_id.as_str(),
                    entry.remote_id,
                    entry.operation.as_str(),
                    serde_json::to_string(&entry.payload)?,
                    entry.retry_count,
                    entry.last_error,
                    now,
                ],
            )?;
            self.conn.execute("DELETE FROM outbox WHERE id = ?1", params![entry.id])?;
            tracing::warn!(
                kind = %entry.entity_type,
                client_id = %entry.client_id,
                operation = %entry.operation,
                retry_count = entry.retry_count,
                error = entry.last_error.as_deref().unwrap_or(""),
                "Abandoned outbox entry after repeated failures"
            );
        }
        Ok(stuck)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Queue contents in drain order.
    pub fn list(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        self.drain(limit, None)
    }

    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_type, client_id, operation, retry_count, last_error, abandoned_at
             FROM outbox_dead_letters
             ORDER BY abandoned_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(id, entity_type, client_id, operation, retry_count, last_error, abandoned_at)| {
                    Ok(DeadLetter {
                        id,
                        entity_type: entity_type.parse().map_err(Error::InvalidInput)?,
                        client_id,
                        operation: operation.parse().map_err(Error::InvalidInput)?,
                        retry_count,
                        last_error,
                        abandoned_at,
                    })
                },
            )
            .collect()
    }

    fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
        Ok(RawEntry {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            client_id: row.get(2)?,
            remote_id: row.get(3)?,
            operation: row.get(4)?,
            payload: row.get(5)?,
            changed_fields: row.get(6)?,
            retry_count: row.get(7)?,
            last_error: row.get(8)?,
            pending_since: row.get(9)?,
            revision: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn parse_entry(raw: RawEntry) -> Result<OutboxEntry> {
        Ok(OutboxEntry {
            id: raw.id,
            entity_type: raw.entity_type.parse().map_err(Error::InvalidInput)?,
            client_id: raw
                .client_id
                .parse()
                .map_err(|_| Error::InvalidInput(format!("Invalid client ID: {}", raw.client_id)))?,
            remote_id: raw.remote_id,
            operation: raw.operation.parse().map_err(Error::InvalidInput)?,
            payload: serde_json::from_str::<Fields>(&raw.payload)?,
            changed_fields: serde_json::from_str::<BTreeSet<String>>(&raw.changed_fields)?,
            retry_count: raw.retry_count,
            last_error: raw.last_error,
            pending_since: raw.pending_since,
            revision: raw.revision,
            updated_at: raw.updated_at,
        })
    }
}

/// Column values before JSON and enum decoding.
struct RawEntry {
    id: i64,
    entity_type: String,
    client_id: String,
    remote_id: Option<String>,
    operation: String,
    payload: String,
    changed_fields: String,
    retry_count: u32,
    last_error: Option<String>,
    pending_since: i64,
    revision: i64,
    updated_at: i64,
}
