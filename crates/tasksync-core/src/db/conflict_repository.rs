//! Field-level conflict log

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::models::{ClientId, EntityKind, SyncConflict};

/// Strategy name recorded for every conflict.
pub const FIELD_LWW: &str = "field-lww";

pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Log a field where a pending local edit was kept over an incoming value.
    pub fn log(
        &self,
        kind: EntityKind,
        client_id: &ClientId,
        field: &str,
        local_ts: i64,
        remote_ts: i64,
        now: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_conflicts (entity_type, client_id, field, local_ts, remote_ts,
                resolved_at, strategy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                kind.as_str(),
                client_id.as_str(),
                field,
                local_ts,
                remote_ts,
                now,
                FIELD_LWW
            ],
        )?;
        Ok(())
    }

    /// Most recent conflicts first.
    pub fn list(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_type, client_id, field, local_ts, remote_ts, resolved_at, strategy
             FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(id, entity_type, client_id, field, local_ts, remote_ts, resolved_at, strategy)| {
                    Ok(SyncConflict {
                        id,
                        entity_type: entity_type.parse().map_err(Error::InvalidInput)?,
                        client_id,
                        field,
                        local_ts,
                        remote_ts,
                        resolved_at,
                        strategy,
                    })
                },
            )
            .collect()
    }
}
