use std::path::Path;

use tasksync_core::EntityKind;

use crate::commands::common::{normalize_record_identifier, open_database, resolve_record};
use crate::error::CliError;

pub async fn run_delete(kind: EntityKind, id: &str, db_path: &Path) -> Result<(), CliError> {
    let normalized_id = normalize_record_identifier(id)?;
    let db = open_database(db_path)?;
    let record = resolve_record(kind, &normalized_id, &db).await?;

    let trashed = db.delete(kind, &record.client_id.to_string()).await?;
    println!("{}", trashed.client_id);
    Ok(())
}

pub async fn run_restore(kind: EntityKind, id: &str, db_path: &Path) -> Result<(), CliError> {
    let normalized_id = normalize_record_identifier(id)?;
    let db = open_database(db_path)?;
    let record = resolve_record(kind, &normalized_id, &db).await?;

    let restored = db.restore(kind, &record.client_id.to_string()).await?;
    println!("{}", restored.client_id);
    Ok(())
}

pub async fn run_purge(kind: EntityKind, id: &str, db_path: &Path) -> Result<(), CliError> {
    let normalized_id = normalize_record_identifier(id)?;
    let db = open_database(db_path)?;
    let record = resolve_record(kind, &normalized_id, &db).await?;

    db.purge(kind, &record.client_id.to_string()).await?;
    println!("{}", record.client_id);
    Ok(())
}
