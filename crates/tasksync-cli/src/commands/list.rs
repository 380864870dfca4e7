use std::path::Path;

use tasksync_core::EntityKind;

use crate::cli::ListArgs;
use crate::commands::common::{
    format_record_lines, list_filter, list_records, record_to_list_item, RecordListItem,
};
use crate::error::CliError;

pub async fn run_list(
    kind: EntityKind,
    args: &ListArgs,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let records = list_records(kind, &list_filter(args), db_path).await?;

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}
