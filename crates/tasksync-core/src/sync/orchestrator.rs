//! Sync orchestrator: drives push, import and pull on a timer and publishes
//! status snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex, RwLock};

use crate::models::RecordEvent;
use crate::remote::RemoteError;
use crate::state::{SyncState, SyncStatusSnapshot};
use crate::util::now_ms;
use crate::{Error, Result};

use super::importer::{run_slice, ImportReport};
use super::pull::{pull_all, PullReport};
use super::push::{push_outbox, PushReport};
use super::SyncContext;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub push: PushReport,
    /// Set while the bulk import is still running
    pub import: Option<ImportReport>,
    /// Set once the bulk import has completed
    pub pull: Option<PullReport>,
}

/// Clears the tick flag when the tick that set it ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator {
    context: RwLock<Arc<SyncContext>>,
    ticking: AtomicBool,
    push_lock: Mutex<()>,
    status: watch::Sender<SyncStatusSnapshot>,
}

impl SyncOrchestrator {
    pub fn new(context: SyncContext) -> Self {
        let (status, _) = watch::channel(SyncStatusSnapshot::default());
        Self {
            context: RwLock::new(Arc::new(context)),
            ticking: AtomicBool::new(false),
            push_lock: Mutex::new(()),
            status,
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatusSnapshot {
        self.status.borrow().clone()
    }

    /// Subscribe to status snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.status.subscribe()
    }

    /// Subscribe to per-record change events.
    pub async fn record_events(&self) -> broadcast::Receiver<RecordEvent> {
        self.context.read().await.db.subscribe()
    }

    /// Replace the whole context, e.g. after a credential change. A tick
    /// already running finishes with the context it started with.
    pub async fn reconfigure(&self, context: SyncContext) {
        *self.context.write().await = Arc::new(context);
        tracing::info!("Sync context reconfigured");
    }

    /// Run one sync cycle right away, even if a timer tick is in flight.
    pub async fn force_sync(&self) -> Result<Option<TickReport>> {
        self.tick(true).await
    }

    /// Run one sync cycle. Returns `Ok(None)` when another tick is running
    /// and `force` is false.
    pub async fn tick(&self, force: bool) -> Result<Option<TickReport>> {
        let acquired = !self.ticking.swap(true, Ordering::AcqRel);
        if !acquired && !force {
            tracing::debug!("Sync tick already running; skipping");
            return Ok(None);
        }
        let _guard = acquired.then(|| TickGuard(&self.ticking));

        let context = self.context.read().await.clone();
        self.publish(&context, SyncState::Syncing, None, false).await;

        let result = self.run_cycle(&context).await;
        match &result {
            Ok(report) => {
                let failure = report
                    .push
                    .failures
                    .iter()
                    .chain(report.pull.iter().flat_map(|pull| &pull.failures))
                    .next();
                if let Some((kind, error)) = failure {
                    let message = format!("{kind}: {error}");
                    self.publish(&context, state_for(error), Some(message), false)
                        .await;
                } else {
                    self.publish(&context, SyncState::Idle, None, true).await;
                }
            }
            Err(error) => self.report_failure(&context, error).await,
        }
        result.map(Some)
    }

    /// Push the outbox without waiting for the timer.
    pub async fn push_now(&self) -> Result<PushReport> {
        let context = self.context.read().await.clone();
        let result = {
            let _push = self.push_lock.lock().await;
            push_outbox(&context).await
        };
        match &result {
            Ok(PushReport { failures, .. }) if !failures.is_empty() => {
                let (kind, error) = &failures[0];
                let message = format!("{kind}: {error}");
                self.publish(&context, state_for(error), Some(message), false)
                    .await;
            }
            Ok(_) => {
                let state = self.status.borrow().state;
                let state = if state == SyncState::Syncing {
                    state
                } else {
                    SyncState::Idle
                };
                self.publish(&context, state, None, false).await;
            }
            Err(error) => self.report_failure(&context, error).await,
        }
        result
    }

    /// Tick every poll interval until `shutdown` turns true or its sender
    /// goes away. Shutdown is only observed between ticks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Sync orchestrator started");
        while !*shutdown.borrow() {
            if let Err(error) = self.tick(false).await {
                tracing::debug!(error = %error, "Tick ended early");
            }

            let period = self.context.read().await.config.poll_interval;
            tokio::select! {
                () = tokio::time::sleep(period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Sync orchestrator stopped");
    }

    async fn run_cycle(&self, context: &SyncContext) -> Result<TickReport> {
        let push = {
            let _push = self.push_lock.lock().await;
            push_outbox(context).await?
        };
        self.publish(context, SyncState::Syncing, None, false).await;

        if !context.db.is_import_complete().await? {
            let import = run_slice(context).await?;
            return Ok(TickReport {
                push,
                import: Some(import),
                pull: None,
            });
        }

        let pull = pull_all(context).await?;
        Ok(TickReport {
            push,
            import: None,
            pull: Some(pull),
        })
    }

    async fn report_failure(&self, context: &SyncContext, error: &Error) {
        let state = error.remote().map_or(SyncState::Error, state_for);
        if state == SyncState::Offline {
            tracing::warn!(error = %error, "Sync cycle interrupted; will retry");
        } else {
            tracing::error!(error = %error, "Sync cycle failed");
        }
        self.publish(context, state, Some(error.to_string()), false)
            .await;
    }

    /// Send a fresh snapshot; `pending_items` is re-read every time.
    async fn publish(
        &self,
        context: &SyncContext,
        state: SyncState,
        message: Option<String>,
        synced: bool,
    ) {
        let pending_items = match context.db.pending_count().await {
            Ok(count) => count,
            Err(error) => {
                tracing::warn!(error = %error, "Could not count pending changes");
                self.status.borrow().pending_items
            }
        };
        let last_synced_at = if synced {
            Some(now_ms())
        } else {
            self.status.borrow().last_synced_at
        };
        self.status.send_replace(SyncStatusSnapshot {
            state,
            pending_items,
            message,
            last_synced_at,
        });
    }
}

const fn state_for(error: &RemoteError) -> SyncState {
    if error.is_offline() {
        SyncState::Offline
    } else {
        SyncState::Error
    }
}
