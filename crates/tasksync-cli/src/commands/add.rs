use std::path::Path;

use serde_json::Value;
use tasksync_core::EntityKind;

use crate::commands::common::{open_database, resolve_new_fields};
use crate::error::CliError;

pub async fn run_add(
    kind: EntityKind,
    title_parts: &[String],
    assignments: &[(String, Value)],
    db_path: &Path,
) -> Result<(), CliError> {
    let fields = resolve_new_fields(kind, title_parts, assignments)?;

    let db = open_database(db_path)?;
    let record = db.create(kind, fields).await?;

    println!("{}", record.client_id);
    Ok(())
}
