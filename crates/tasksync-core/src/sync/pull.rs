//! Incremental pulls once the bulk import has finished.

use crate::models::{EntityKind, PullCursor};
use crate::remote::{PageFilter, RemoteAdapter, RemoteError};
use crate::{Error, Result};

use super::SyncContext;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pages: usize,
    /// Records whose local state changed
    pub changed: usize,
    /// Kinds whose pull failed; the others were still pulled
    pub failures: Vec<(EntityKind, RemoteError)>,
}

/// Pull every kind in turn. A remote failure in one kind is recorded and the
/// next kind is still pulled.
pub async fn pull_all(ctx: &SyncContext) -> Result<PullReport> {
    let mut report = PullReport::default();
    for kind in ctx.kinds() {
        let Some(adapter) = ctx.adapter(kind) else {
            continue;
        };
        match pull_kind(ctx, kind, adapter.as_ref()).await {
            Ok((pages, changed)) => {
                report.pages += pages;
                report.changed += changed;
            }
            Err(Error::Remote(error)) => {
                tracing::error!(%kind, error = %error, "Pull failed");
                report.failures.push((kind, error));
            }
            Err(other) => return Err(other),
        }
    }
    Ok(report)
}

/// Fetch everything edited since the stored pull timestamp, persisting the
/// cursor after every applied page.
async fn pull_kind(
    ctx: &SyncContext,
    kind: EntityKind,
    adapter: &dyn RemoteAdapter,
) -> Result<(usize, usize)> {
    let mut state = ctx.db.pull_cursor(kind).await?.unwrap_or_default();
    let filter = PageFilter {
        edited_since: Some((state.since - ctx.config.pull_overlap_ms()).max(0)),
        edited_before: None,
    };
    let page_size = ctx.config.pull_page_size;

    let mut pages = 0;
    let mut changed = 0;
    loop {
        let page = ctx
            .client
            .call("pull page", || {
                adapter.fetch_page(&filter, state.cursor.as_deref(), page_size)
            })
            .await?;
        changed += ctx.db.apply_remote_page(kind, &page.records).await?.changed;
        pages += 1;
        state.high_water = page
            .records
            .iter()
            .map(|record| record.last_edited)
            .fold(state.high_water, i64::max);

        match page.next_cursor {
            Some(next) if page.has_more => {
                state.cursor = Some(next);
                ctx.db.set_pull_cursor(kind, &state).await?;
            }
            _ => {
                state = PullCursor {
                    since: state.since.max(state.high_water),
                    cursor: None,
                    high_water: state.high_water,
                };
                ctx.db.set_pull_cursor(kind, &state).await?;
                break;
            }
        }
    }

    if changed > 0 {
        tracing::info!(%kind, changed, pages, "Pulled remote changes");
    } else {
        tracing::debug!(%kind, pages, "No remote changes");
    }
    Ok((pages, changed))
}
