//! Partitioned bulk import.
//!
//! Deep pagination cursors make the remote service time out, so the first
//! import walks fixed edit-time windows newest first, each with its own
//! shallow cursor. Progress is persisted after every applied page; applying
//! a page is an idempotent upsert, so resuming mid-window is safe.

use crate::models::{EntityKind, ImportPhase, ImportProgress, PullCursor};
use crate::remote::{CallOptions, PageFilter, RemoteAdapter};
use crate::util::now_ms;
use crate::{Error, Result};

use super::SyncContext;

const DAY_MS: i64 = 24 * 60 * 60 * 1_000;

/// Window bounds in days before the anchor: `(newer, older)`. `None` leaves
/// the older side open.
pub const IMPORT_WINDOWS: [(i64, Option<i64>); 10] = [
    (0, Some(1)),
    (1, Some(3)),
    (3, Some(7)),
    (7, Some(14)),
    (14, Some(30)),
    (30, Some(60)),
    (60, Some(90)),
    (90, Some(180)),
    (180, Some(365)),
    (365, None),
];

/// The edit-time filter for window `index`. The newest window is open
/// towards the future so edits made during the import are not missed.
pub fn window_filter(anchor_ms: i64, index: usize) -> Option<PageFilter> {
    let (newer, older) = *IMPORT_WINDOWS.get(index)?;
    Some(PageFilter {
        edited_since: older.map(|days| anchor_ms - days * DAY_MS),
        edited_before: (newer > 0).then(|| anchor_ms - newer * DAY_MS),
    })
}

fn next_window(index: usize) -> ImportPhase {
    if index + 1 < IMPORT_WINDOWS.len() {
        ImportPhase::ImportingWindow {
            index: index + 1,
            cursor: None,
        }
    } else {
        ImportPhase::Completed
    }
}

/// What one import slice did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub pages: usize,
    pub imported: usize,
    pub abandoned_windows: usize,
    /// Every kind finished; the orchestrator switches to incremental pulls
    pub completed: bool,
}

/// Run at most `import_pages_per_slice` pages of the bulk import.
///
/// Returns [`Error::ImportPaused`] when a retryable failure outlasts the
/// client's backoff; progress stays where it was and the next slice resumes.
pub async fn run_slice(ctx: &SyncContext) -> Result<ImportReport> {
    let kinds = ctx.kinds();
    let mut report = ImportReport::default();
    if kinds.is_empty() {
        return Ok(report);
    }

    let mut budget = ctx.config.import_pages_per_slice.max(1);
    for &kind in &kinds {
        if budget == 0 {
            break;
        }
        let Some(adapter) = ctx.adapter(kind) else {
            continue;
        };
        let mut progress = ctx.db.import_progress(kind).await?;
        if progress.is_completed() {
            continue;
        }
        import_kind(
            ctx,
            kind,
            adapter.as_ref(),
            &mut progress,
            &mut budget,
            &mut report,
        )
        .await?;
    }

    for &kind in &kinds {
        if !ctx.db.import_progress(kind).await?.is_completed() {
            return Ok(report);
        }
    }
    ctx.db.set_import_complete().await?;
    tracing::info!("Bulk import complete");
    report.completed = true;
    Ok(report)
}

async fn import_kind(
    ctx: &SyncContext,
    kind: EntityKind,
    adapter: &dyn RemoteAdapter,
    progress: &mut ImportProgress,
    budget: &mut usize,
    report: &mut ImportReport,
) -> Result<()> {
    let anchor = *progress.anchor_ms.get_or_insert_with(now_ms);
    if progress.phase == ImportPhase::NotStarted {
        tracing::info!(%kind, "Starting bulk import");
        progress.phase = ImportPhase::ImportingWindow {
            index: 0,
            cursor: None,
        };
        ctx.db.set_import_progress(kind, progress).await?;
    }

    let page_size = ctx.config.import_page_size;
    let options = CallOptions {
        retry_timeouts: false,
    };

    while *budget > 0 {
        let ImportPhase::ImportingWindow { index, cursor } = progress.phase.clone() else {
            break;
        };
        let Some(filter) = window_filter(anchor, index) else {
            progress.phase = ImportPhase::Completed;
            finish_page(ctx, kind, progress).await?;
            break;
        };
        *budget -= 1;

        let fetched = ctx
            .client
            .call_with("import page", options, || {
                adapter.fetch_page(&filter, cursor.as_deref(), page_size)
            })
            .await;
        let page = match fetched {
            Ok(page) => page,
            Err(error) if error.is_timeout() => {
                tracing::warn!(
                    %kind,
                    window = index,
                    error = %error,
                    "Import window timed out; abandoning it"
                );
                progress.abandoned_windows.push(index);
                progress.phase = next_window(index);
                report.abandoned_windows += 1;
                finish_page(ctx, kind, progress).await?;
                continue;
            }
            Err(error) if error.is_retryable() => return Err(Error::ImportPaused(error)),
            Err(error) => return Err(error.into()),
        };

        let received = page.records.len();
        // A page replayed after a crash inserts nothing new
        let applied = ctx.db.apply_remote_page(kind, &page.records).await?;
        report.pages += 1;
        report.imported += applied.inserted;
        progress.imported += applied.inserted as u64;
        tracing::debug!(
            %kind,
            window = index,
            records = received,
            inserted = applied.inserted,
            "Imported page"
        );

        let target_reached = ctx
            .config
            .import_target_records
            .is_some_and(|target| progress.imported >= target);
        progress.phase = match page.next_cursor {
            _ if target_reached => ImportPhase::Completed,
            Some(next) if page.has_more => ImportPhase::ImportingWindow {
                index,
                cursor: Some(next),
            },
            _ => next_window(index),
        };
        finish_page(ctx, kind, progress).await?;
    }
    Ok(())
}

/// Persist progress, seeding the pull timestamp once the kind is done.
async fn finish_page(
    ctx: &SyncContext,
    kind: EntityKind,
    progress: &ImportProgress,
) -> Result<()> {
    if progress.is_completed() {
        let anchor = progress.anchor_ms.unwrap_or_else(now_ms);
        ctx.db
            .set_pull_cursor(
                kind,
                &PullCursor {
                    since: anchor,
                    cursor: None,
                    high_water: anchor,
                },
            )
            .await?;
        tracing::info!(
            %kind,
            imported = progress.imported,
            abandoned = ?progress.abandoned_windows,
            "Finished bulk import"
        );
    }
    ctx.db.set_import_progress(kind, progress).await
}
