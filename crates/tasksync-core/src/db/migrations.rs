//! Database migrations

use crate::error::Result;
use crate::models::{EntityKind, EntitySchema};
use rusqlite::{params, Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);
    Ok(version)
}

/// Apply `statements` and record `version`, all in one transaction.
fn apply(conn: &Connection, version: i32, statements: &[String]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for statement in statements {
        tx.execute_batch(statement)?;
    }
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

fn record_table(schema: &EntitySchema) -> Vec<String> {
    let table = schema.table;
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                client_id TEXT PRIMARY KEY,
                remote_id TEXT UNIQUE,
                unique_external_id TEXT UNIQUE,
                fields TEXT NOT NULL,
                sync_status TEXT NOT NULL,
                last_modified_local INTEGER NOT NULL,
                last_modified_remote INTEGER NOT NULL,
                field_local_timestamps TEXT NOT NULL,
                field_remote_timestamps TEXT NOT NULL,
                sync_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                status_key TEXT,
                date_key INTEGER,
                flag_key INTEGER,
                relation_key TEXT
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_sync_status ON {table}(sync_status)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table}(updated_at DESC)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_status_key ON {table}(status_key)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_date_key ON {table}(date_key)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_flag_key ON {table}(flag_key)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_relation_key ON {table}(relation_key)"),
    ]
}

/// Migration to version 1: record tables, outbox and sync state
fn migrate_v1(conn: &Connection) -> Result<()> {
    let mut statements = vec![
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )"
        .to_string(),
    ];
    for kind in EntityKind::ALL {
        statements.extend(record_table(kind.schema()));
    }
    statements.extend([
        "CREATE TABLE IF NOT EXISTS outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            client_id TEXT NOT NULL,
            remote_id TEXT,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            changed_fields TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            pending_since INTEGER NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            updated_at INTEGER NOT NULL,
            UNIQUE (entity_type, client_id)
        )"
        .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(pending_since, id)".to_string(),
        // Importer and puller progress, JSON values
        "CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )"
        .to_string(),
    ]);

    apply(conn, 1, &statements)
}

/// Migration to version 2: field-level conflict log
fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            client_id TEXT NOT NULL,
            field TEXT NOT NULL,
            local_ts INTEGER NOT NULL,
            remote_ts INTEGER NOT NULL,
            resolved_at INTEGER NOT NULL,
            strategy TEXT NOT NULL
        )"
        .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record ON sync_conflicts(entity_type, client_id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC)"
            .to_string(),
    ];

    apply(conn, 2, &statements)
}

/// Migration to version 3: dead letters for abandoned outbox entries
fn migrate_v3(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS outbox_dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            client_id TEXT NOT NULL,
            remote_id TEXT,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            last_error TEXT,
            abandoned_at INTEGER NOT NULL
        )"
        .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_dead_letters_abandoned_at ON outbox_dead_letters(abandoned_at DESC)"
            .to_string(),
    ];

    apply(conn, CURRENT_VERSION, &statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_every_kind_gets_a_table() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();

        for kind in EntityKind::ALL {
            assert!(table_exists(&conn, kind.schema().table), "{kind}");
        }
        for table in ["outbox", "sync_state", "sync_conflicts", "outbox_dead_letters"] {
            assert!(table_exists(&conn, table), "{table}");
        }
    }
}
