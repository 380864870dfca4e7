use std::path::Path;

use serde_json::Value;
use tasksync_core::EntityKind;

use crate::commands::common::{
    assignments_to_fields, capture_editor_input_with_initial, diff_fields,
    normalize_record_identifier, open_database, parse_fields_document, resolve_record,
};
use crate::error::CliError;

pub async fn run_edit(
    kind: EntityKind,
    id: &str,
    assignments: &[(String, Value)],
    unset: &[String],
    db_path: &Path,
) -> Result<(), CliError> {
    let normalized_id = normalize_record_identifier(id)?;
    let db = open_database(db_path)?;
    let record = resolve_record(kind, &normalized_id, &db).await?;
    let client_id = record.client_id.to_string();

    let mut patch = assignments_to_fields(assignments);
    for name in unset {
        patch.insert(name.clone(), Value::Null);
    }

    if patch.is_empty() {
        let initial = serde_json::to_string_pretty(&record.fields)?;
        let Some(edited) = capture_editor_input_with_initial(&initial)? else {
            return Err(CliError::EmptyFields);
        };
        patch = diff_fields(&record.fields, &parse_fields_document(&edited)?);
    }

    if patch.is_empty() {
        println!("{client_id}");
        return Ok(());
    }

    let updated = db.update(kind, &client_id, &patch).await?;
    println!("{}", updated.client_id);
    Ok(())
}
