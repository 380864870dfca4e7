//! Persisted sync progress, stored as JSON values under string keys.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::models::{EntityKind, ImportProgress, PullCursor};

const IMPORT_COMPLETE_KEY: &str = "import.complete";

fn import_key(kind: EntityKind) -> String {
    format!("import.{kind}")
}

fn pull_key(kind: EntityKind) -> String {
    format!("pull.{kind}")
}

pub struct SqliteSyncStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSyncStateRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|value| serde_json::from_str(&value).map_err(Into::into))
            .transpose()
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T, now: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, now],
        )?;
        Ok(())
    }

    pub fn import_progress(&self, kind: EntityKind) -> Result<ImportProgress> {
        Ok(self.get(&import_key(kind))?.unwrap_or_default())
    }

    pub fn set_import_progress(
        &self,
        kind: EntityKind,
        progress: &ImportProgress,
        now: i64,
    ) -> Result<()> {
        self.set(&import_key(kind), progress, now)
    }

    pub fn pull_cursor(&self, kind: EntityKind) -> Result<Option<PullCursor>> {
        self.get(&pull_key(kind))
    }

    pub fn set_pull_cursor(&self, kind: EntityKind, cursor: &PullCursor, now: i64) -> Result<()> {
        self.set(&pull_key(kind), cursor, now)
    }

    pub fn is_import_complete(&self) -> Result<bool> {
        Ok(self.get::<bool>(IMPORT_COMPLETE_KEY)?.unwrap_or(false))
    }

    pub fn set_import_complete(&self, now: i64) -> Result<()> {
        self.set(IMPORT_COMPLETE_KEY, &true, now)
    }

    /// Forget import and pull progress so the next tick imports from scratch.
    pub fn reset(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sync_state WHERE key LIKE 'import.%' OR key LIKE 'pull.%'",
            [],
        )?;
        Ok(())
    }
}
