use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tasksync_core::config::EngineConfig;
use tasksync_core::models::{DeadLetter, Fields, ListFilter, OutboxEntry, SyncConflict, SyncRecord};
use tasksync_core::services::DatabaseService;
use tasksync_core::sync::SyncContext;
use tasksync_core::util::parse_timestamp;
use tasksync_core::EntityKind;

use crate::cli::ListArgs;
use crate::error::CliError;

const SHORT_ID_LEN: usize = 13;

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub kind: EntityKind,
    pub remote_id: Option<String>,
    pub title: String,
    pub sync_status: String,
    pub sync_error: Option<String>,
    pub updated_at: i64,
    pub relative_time: String,
    pub fields: Fields,
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub kind: EntityKind,
    pub client_id: String,
    pub field: String,
    pub local_ts: i64,
    pub remote_ts: i64,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub strategy: String,
}

/// `key=value`; the value is JSON when it parses as JSON, a string otherwise.
pub fn parse_assignment(raw: &str) -> Result<(String, Value), String> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(format!("expected KEY=VALUE, got '{raw}'"));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing field name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn parse_date(raw: &str) -> Result<i64, String> {
    parse_timestamp(raw).ok_or_else(|| format!("expected YYYY-MM-DD or RFC 3339, got '{raw}'"))
}

pub fn assignments_to_fields(assignments: &[(String, Value)]) -> Fields {
    assignments.iter().cloned().collect()
}

pub fn list_filter(args: &ListArgs) -> ListFilter {
    ListFilter {
        sync_status: args.sync_status,
        status: args.status.clone(),
        date_from: args.from,
        date_to: args.to,
        flag: args.flag,
        related_to: args.related_to.clone(),
        include_trashed: args.trashed,
        limit: args.limit,
        offset: args.offset,
    }
}

pub async fn list_records(
    kind: EntityKind,
    filter: &ListFilter,
    db_path: &Path,
) -> Result<Vec<SyncRecord>, CliError> {
    let db = open_database(db_path)?;
    Ok(db.list(kind, filter).await?)
}

/// Client ids of `kind` starting with `prefix`, trashed records included.
async fn list_ids_by_prefix(
    db: &DatabaseService,
    kind: EntityKind,
    prefix: &str,
    limit: usize,
) -> Result<Vec<String>, CliError> {
    const PAGE_SIZE: usize = 500;

    let mut matches = Vec::new();
    let mut filter = ListFilter {
        include_trashed: true,
        ..ListFilter::with_limit(PAGE_SIZE)
    };

    loop {
        let batch = db.list(kind, &filter).await?;
        let count = batch.len();
        matches.extend(
            batch
                .into_iter()
                .map(|record| record.client_id.to_string())
                .filter(|id| id.starts_with(prefix)),
        );

        if matches.len() >= limit || count < PAGE_SIZE {
            break;
        }
        filter.offset += count;
    }

    matches.truncate(limit);
    Ok(matches)
}

pub async fn resolve_record(
    kind: EntityKind,
    query: &str,
    db: &DatabaseService,
) -> Result<SyncRecord, CliError> {
    let not_found = || CliError::RecordNotFound {
        kind: kind.to_string(),
        query: query.to_string(),
    };

    if let Some(record) = db.get(kind, query).await? {
        return Ok(record);
    }

    let matching_ids = list_ids_by_prefix(db, kind, query, 3).await?;

    match matching_ids.as_slice() {
        [] => Err(not_found()),
        [id] => db.get(kind, id).await?.ok_or_else(not_found),
        _ => {
            let options = matching_ids
                .iter()
                .map(|id| short_id(id))
                .collect::<Vec<_>>()
                .join(", ");

            Err(CliError::AmbiguousRecordId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

pub fn format_record_lines(records: &[SyncRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let short_id = short_id(&record.client_id.to_string());
            let preview = record_preview(record, 40);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            let status = record.sync_status.as_str();

            match &record.sync_error {
                Some(error) => format!(
                    "{short_id:<13}  {preview:<40}  {relative_time:<10}  {status:<8}  {error}"
                ),
                None => format!("{short_id:<13}  {preview:<40}  {relative_time:<10}  {status}"),
            }
        })
        .collect()
}

pub fn record_to_list_item(record: &SyncRecord) -> RecordListItem {
    let now_ms = Utc::now().timestamp_millis();

    RecordListItem {
        id: record.client_id.to_string(),
        kind: record.kind,
        remote_id: record.remote_id.clone(),
        title: record_preview(record, 80),
        sync_status: record.sync_status.to_string(),
        sync_error: record.sync_error.clone(),
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
        fields: record.fields.clone(),
    }
}

/// First line of the title, whitespace collapsed, cut to `max_chars`.
pub fn record_preview(record: &SyncRecord, max_chars: usize) -> String {
    let first_line = record.title().unwrap_or("").lines().next().unwrap_or("").trim();
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.is_empty() {
        "(untitled)".to_string()
    } else if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        kind: conflict.entity_type,
        client_id: conflict.client_id.clone(),
        field: conflict.field.clone(),
        local_ts: conflict.local_ts,
        remote_ts: conflict.remote_ts,
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_sync_timestamp(conflict.resolved_at),
        strategy: conflict.strategy.clone(),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<9}  {}={}  field={}  local={} remote={}",
                format_sync_timestamp(conflict.resolved_at),
                conflict.strategy,
                conflict.entity_type,
                conflict.client_id,
                conflict.field,
                conflict.local_ts,
                conflict.remote_ts
            )
        })
        .collect()
}

pub fn format_outbox_lines(entries: &[OutboxEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let fields = entry
                .changed_fields
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",");
            let line = format!(
                "{}  {:<6}  {}={}  retries={}  fields=[{fields}]",
                format_sync_timestamp(entry.pending_since),
                entry.operation.as_str(),
                entry.entity_type,
                short_id(&entry.client_id.to_string()),
                entry.retry_count
            );
            match &entry.last_error {
                Some(error) => format!("{line}  last_error={error}"),
                None => line,
            }
        })
        .collect()
}

pub fn format_dead_letter_lines(dead_letters: &[DeadLetter]) -> Vec<String> {
    dead_letters
        .iter()
        .map(|dead| {
            format!(
                "{}  {:<6}  {}={}  attempts={}  error={}",
                format_sync_timestamp(dead.abandoned_at),
                dead.operation.as_str(),
                dead.entity_type,
                dead.client_id,
                dead.retry_count,
                dead.last_error.as_deref().unwrap_or("-")
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

/// Fields for a new record: title words and `--set` values, else piped or
/// edited JSON.
pub fn resolve_new_fields(
    kind: EntityKind,
    title_parts: &[String],
    assignments: &[(String, Value)],
) -> Result<Fields, CliError> {
    let mut fields = assignments_to_fields(assignments);
    let title = title_parts.join(" ");
    let title = title.trim();
    if !title.is_empty() {
        fields.insert(
            kind.schema().title_field.to_string(),
            Value::String(title.to_string()),
        );
    }
    if !fields.is_empty() {
        return Ok(fields);
    }

    if let Some(input) = read_piped_stdin()? {
        return parse_fields_document(&input);
    }

    let template = new_record_template(kind);
    if let Some(input) = capture_editor_input_with_initial(&template)? {
        let fields = parse_fields_document(&input)?;
        if fields.values().any(|value| !value.is_null()) {
            return Ok(fields);
        }
    }

    Err(CliError::EmptyFields)
}

fn new_record_template(kind: EntityKind) -> String {
    let mut template = Fields::new();
    template.insert(kind.schema().title_field.to_string(), Value::Null);
    serde_json::to_string_pretty(&template).unwrap_or_default()
}

pub fn parse_fields_document(input: &str) -> Result<Fields, CliError> {
    match serde_json::from_str::<Value>(input)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(CliError::InvalidEditedFields),
    }
}

/// Fields that differ between `before` and `after`; removed keys become null.
pub fn diff_fields(before: &Fields, after: &Fields) -> Fields {
    let mut patch = after
        .iter()
        .filter(|(name, value)| before.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect::<Fields>();
    for name in before.keys() {
        if !after.contains_key(name) {
            patch.insert(name.clone(), Value::Null);
        }
    }
    patch
}

pub fn normalize_record_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyRecordId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    let trimmed = buffer.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

pub fn capture_editor_input_with_initial(
    initial_content: &str,
) -> Result<Option<String>, CliError> {
    let editor = preferred_editor();
    let temp_file = create_temp_record_file_path();
    std::fs::write(&temp_file, initial_content)?;

    let launch_result = launch_editor(&editor, &temp_file);
    let edited = std::fs::read_to_string(&temp_file)?;
    let _ = std::fs::remove_file(&temp_file);

    launch_result?;
    let trimmed = edited.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

pub fn launch_editor(editor: &str, file_path: &Path) -> Result<(), CliError> {
    match Command::new(editor).arg(file_path).status() {
        Ok(status) => {
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        // EDITOR may carry arguments, e.g. "code --wait"
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let mut parts = editor.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(CliError::EditorFailed("empty EDITOR command".into()));
            };

            let status = Command::new(program).args(parts).arg(file_path).status()?;
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) => Err(CliError::Io(err)),
    }
}

pub fn preferred_editor() -> String {
    env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| default_editor().to_string())
}

pub const fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "vi"
    }
}

fn create_temp_record_file_path() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    env::temp_dir().join(format!("tasksync-record-{}-{now}.json", std::process::id()))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("TASKSYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tasksync")
        .join("tasksync.db")
}

pub fn open_database(path: &Path) -> Result<DatabaseService, CliError> {
    Ok(DatabaseService::open_path(path)?)
}

/// A sync context with HTTP adapters, or [`CliError::SyncNotConfigured`].
pub fn sync_context(db: DatabaseService, config: EngineConfig) -> Result<SyncContext, CliError> {
    if config.remote.is_none() {
        return Err(CliError::SyncNotConfigured);
    }
    Ok(SyncContext::from_config(db, config)?)
}
