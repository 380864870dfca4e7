//! Outbox drain: sends queued local changes to the remote service.

use std::collections::HashSet;

use crate::models::{EntityKind, Operation, OutboxEntry};
use crate::remote::{ErrorKind, RemoteAdapter, RemoteError};
use crate::{Error, Result};

use super::SyncContext;

/// What one pass over the outbox did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    /// Record-level failures counted towards abandonment
    pub failed: usize,
    /// Records trashed because the remote copy is gone
    pub trashed: usize,
    /// Entries moved to the dead-letter log
    pub abandoned: usize,
    /// Kinds whose remaining entries were skipped after a transient failure
    pub failures: Vec<(EntityKind, RemoteError)>,
}

/// Walk the outbox oldest first, one batch at a time.
///
/// Record-level failures are recorded and the walk continues. A transient
/// failure (network, rate limiting, 5xx) skips the rest of that kind's
/// entries for this pass; an auth failure stops the walk and is returned.
pub async fn push_outbox(ctx: &SyncContext) -> Result<PushReport> {
    let mut report = PushReport::default();
    let mut after = None;
    let mut blocked = HashSet::new();

    loop {
        let batch = ctx
            .db
            .drain_outbox(ctx.config.outbox_batch_size, after)
            .await?;
        if batch.is_empty() {
            break;
        }
        tracing::debug!(entries = batch.len(), "Pushing outbox batch");

        for entry in &batch {
            after = Some((entry.pending_since, entry.id));
            if blocked.contains(&entry.entity_type) {
                continue;
            }
            let Some(adapter) = ctx.adapter(entry.entity_type) else {
                continue;
            };

            match push_entry(ctx, adapter.as_ref(), entry).await {
                Ok(()) => report.pushed += 1,
                Err(Error::Remote(error)) if error.kind == ErrorKind::NotFound => {
                    tracing::warn!(
                        kind = %entry.entity_type,
                        client_id = %entry.client_id,
                        operation = %entry.operation,
                        "Remote record is gone; trashing local copy"
                    );
                    if entry.operation == Operation::Delete {
                        ctx.db.acknowledge_delete(entry).await?;
                    } else {
                        ctx.db.mark_remote_missing(entry).await?;
                        report.trashed += 1;
                    }
                }
                Err(Error::Remote(error)) if error.kind == ErrorKind::Auth => {
                    ctx.db.record_push_failure(entry, &error, false).await?;
                    return Err(Error::Remote(error));
                }
                Err(Error::Remote(error)) if error.is_session_level() => {
                    tracing::warn!(
                        kind = %entry.entity_type,
                        client_id = %entry.client_id,
                        error = %error,
                        "Push interrupted; skipping the rest of this kind"
                    );
                    ctx.db.record_push_failure(entry, &error, false).await?;
                    blocked.insert(entry.entity_type);
                    report.failures.push((entry.entity_type, error));
                }
                Err(Error::Remote(error)) => {
                    tracing::warn!(
                        kind = %entry.entity_type,
                        client_id = %entry.client_id,
                        attempt = entry.retry_count + 1,
                        error = %error,
                        "Push rejected"
                    );
                    ctx.db.record_push_failure(entry, &error, true).await?;
                    report.failed += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    let abandoned = ctx.db.purge_stuck(ctx.config.stuck_threshold).await?;
    report.abandoned = abandoned.len();
    Ok(report)
}

async fn push_entry(
    ctx: &SyncContext,
    adapter: &dyn RemoteAdapter,
    entry: &OutboxEntry,
) -> Result<()> {
    match (entry.operation, entry.remote_id.as_deref()) {
        (Operation::Delete, Some(remote_id)) => {
            ctx.client
                .call("delete", || adapter.delete(remote_id))
                .await?;
            ctx.db.acknowledge_delete(entry).await?;
        }
        // Nothing remote to delete
        (Operation::Delete, None) => {
            ctx.db.acknowledge_delete(entry).await?;
        }
        (Operation::Update, Some(remote_id)) => {
            let remote = ctx
                .client
                .call("update", || adapter.update(remote_id, &entry.payload))
                .await?;
            ctx.db.acknowledge_push(entry, &remote).await?;
        }
        (Operation::Create | Operation::Update, _) => {
            let remote = ctx
                .client
                .call("create", || adapter.create(&entry.payload))
                .await?;
            ctx.db.acknowledge_push(entry, &remote).await?;
        }
    }
    tracing::debug!(
        kind = %entry.entity_type,
        client_id = %entry.client_id,
        operation = %entry.operation,
        "Pushed change"
    );
    Ok(())
}
