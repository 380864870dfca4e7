use std::path::Path;

use serde::Serialize;
use tasksync_core::config::EngineConfig;
use tasksync_core::models::{ImportPhase, ImportProgress};
use tasksync_core::sync::{SyncOrchestrator, TickReport, IMPORT_WINDOWS};
use tasksync_core::EntityKind;
use tokio::sync::watch;

use crate::commands::common::{
    format_dead_letter_lines, format_outbox_lines, format_sync_conflict_lines,
    format_sync_timestamp, open_database, sync_conflict_to_item, sync_context, SyncConflictItem,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct SyncStatusItem {
    pub pending_items: usize,
    pub import_complete: bool,
    pub kinds: Vec<KindStatusItem>,
}

#[derive(Debug, Serialize)]
pub struct KindStatusItem {
    pub kind: EntityKind,
    pub import: String,
    pub imported: u64,
    pub abandoned_windows: Vec<usize>,
    pub pulled_since: Option<i64>,
}

pub async fn run_sync(db_path: &Path, config: EngineConfig) -> Result<(), CliError> {
    let db = open_database(db_path)?;
    let orchestrator = SyncOrchestrator::new(sync_context(db, config)?);

    match orchestrator.force_sync().await? {
        Some(report) => {
            for line in format_tick_report(&report) {
                println!("{line}");
            }
        }
        None => println!("Sync already running"),
    }
    println!("{}", orchestrator.status().summary());
    Ok(())
}

/// Tick on the poll interval until Ctrl-C, printing status changes.
pub async fn run_sync_daemon(db_path: &Path, config: EngineConfig) -> Result<(), CliError> {
    let db = open_database(db_path)?;
    let orchestrator = SyncOrchestrator::new(sync_context(db, config)?);

    let (shutdown, receiver) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted; stopping after the current cycle");
            let _ = shutdown.send(true);
        }
    });

    let mut status = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        let mut last = String::new();
        while status.changed().await.is_ok() {
            let summary = status.borrow_and_update().summary();
            if summary != last {
                println!("{summary}");
                last = summary;
            }
        }
    });

    orchestrator.run(receiver).await;
    drop(orchestrator);
    let _ = printer.await;
    Ok(())
}

pub async fn run_sync_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path)?;

    let mut kinds = Vec::new();
    for kind in EntityKind::ALL {
        let progress = db.import_progress(kind).await?;
        let pulled_since = db.pull_cursor(kind).await?.map(|cursor| cursor.since);
        kinds.push(KindStatusItem {
            kind,
            import: describe_import(&progress),
            imported: progress.imported,
            abandoned_windows: progress.abandoned_windows,
            pulled_since,
        });
    }
    let status = SyncStatusItem {
        pending_items: db.pending_count().await?,
        import_complete: db.is_import_complete().await?,
        kinds,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Pending changes: {}", status.pending_items);
    println!(
        "Bulk import: {}",
        if status.import_complete {
            "complete"
        } else {
            "in progress"
        }
    );
    for kind in &status.kinds {
        let pulled = kind
            .pulled_since
            .map_or_else(|| "never".to_string(), format_sync_timestamp);
        println!(
            "{:<10}  import={:<12}  imported={:<6}  pulled_since={pulled}",
            kind.kind.as_str(),
            kind.import,
            kind.imported
        );
    }
    Ok(())
}

pub async fn run_sync_outbox(limit: usize, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path)?;
    let entries = db.list_outbox(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }

    for line in format_outbox_lines(&entries) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_conflicts(
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path)?;
    let conflicts = db.list_conflicts(limit).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_failures(
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path)?;
    let dead_letters = db.list_dead_letters(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&dead_letters)?);
        return Ok(());
    }

    if dead_letters.is_empty() {
        println!("No abandoned changes.");
        return Ok(());
    }

    for line in format_dead_letter_lines(&dead_letters) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_reset_import(db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path)?;
    db.reset_sync_state().await?;
    println!("Import progress cleared; the next sync imports everything again");
    Ok(())
}

pub fn describe_import(progress: &ImportProgress) -> String {
    match &progress.phase {
        ImportPhase::NotStarted => "not started".to_string(),
        ImportPhase::ImportingWindow { index, .. } => {
            format!("window {}/{}", index + 1, IMPORT_WINDOWS.len())
        }
        ImportPhase::Completed => "complete".to_string(),
    }
}

pub fn format_tick_report(report: &TickReport) -> Vec<String> {
    let push = &report.push;
    let mut lines = vec![format!(
        "Pushed {} change(s); {} rejected, {} trashed, {} abandoned",
        push.pushed, push.failed, push.trashed, push.abandoned
    )];
    for (kind, error) in &push.failures {
        lines.push(format!("Push paused for {kind}: {error}"));
    }

    if let Some(import) = &report.import {
        let state = if import.completed {
            "complete"
        } else {
            "continues next cycle"
        };
        lines.push(format!(
            "Imported {} record(s) from {} page(s); import {state}",
            import.imported, import.pages
        ));
        if import.abandoned_windows > 0 {
            lines.push(format!(
                "Skipped {} timed-out import window(s)",
                import.abandoned_windows
            ));
        }
    }

    if let Some(pull) = &report.pull {
        lines.push(format!(
            "Pulled {} change(s) from {} page(s)",
            pull.changed, pull.pages
        ));
        for (kind, error) in &pull.failures {
            lines.push(format!("Pull failed for {kind}: {error}"));
        }
    }

    lines
}
