//! Shared database service wrapper used by the sync engine and clients.
//!
//! Every method takes the connection lock, runs one repository call and
//! releases the lock before returning, so the lock is never held while a
//! caller awaits the network.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::db::{
    Database, RecordRepository, SqliteConflictRepository, SqliteOutboxRepository,
    SqliteRecordRepository, SqliteSyncStateRepository, UpsertOutcome,
};
use crate::models::{
    DeadLetter, EntityKind, Fields, ImportProgress, ListFilter, OutboxEntry, PullCursor,
    RecordChange, RecordEvent, SyncConflict, SyncRecord,
};
use crate::remote::{RemoteError, RemoteRecord};
use crate::util::now_ms;
use crate::Result;

const EVENT_CAPACITY: usize = 256;

/// What merging one page of remote records did locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageApplied {
    /// Records whose local state changed
    pub changed: usize,
    /// Records seen here for the first time
    pub inserted: usize,
}

/// Thread-safe service for DB and repository operations.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
    events: broadcast::Sender<RecordEvent>,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::debug!(path = %db_path.display(), "Opening database");
        Ok(Self::from_database(Database::open(&db_path)?))
    }

    /// Open an in-memory database service (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    fn from_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db: Arc::new(Mutex::new(db)),
            events,
        }
    }

    /// Per-record change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.events.subscribe()
    }

    fn emit(&self, record: &SyncRecord, change: RecordChange) {
        // No subscribers is fine
        let _ = self.events.send(RecordEvent {
            kind: record.kind,
            client_id: record.client_id,
            change,
        });
    }

    /// Create a record and queue it for push.
    pub async fn create(&self, kind: EntityKind, fields: Fields) -> Result<SyncRecord> {
        let record = {
            let db = self.db.lock().await;
            SqliteRecordRepository::new(db.connection(), kind).create(fields, now_ms())?
        };
        self.emit(&record, RecordChange::Created);
        Ok(record)
    }

    /// Apply a partial local edit.
    pub async fn update(&self, kind: EntityKind, id: &str, patch: &Fields) -> Result<SyncRecord> {
        let record = {
            let db = self.db.lock().await;
            SqliteRecordRepository::new(db.connection(), kind).update(id, patch, now_ms())?
        };
        self.emit(&record, RecordChange::Updated);
        Ok(record)
    }

    /// Soft-delete a record.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<SyncRecord> {
        let record = {
            let db = self.db.lock().await;
            SqliteRecordRepository::new(db.connection(), kind).mark_trashed(id, now_ms())?
        };
        self.emit(&record, RecordChange::Trashed);
        Ok(record)
    }

    pub async fn restore(&self, kind: EntityKind, id: &str) -> Result<SyncRecord> {
        let record = {
            let db = self.db.lock().await;
            SqliteRecordRepository::new(db.connection(), kind).restore(id, now_ms())?
        };
        self.emit(&record, RecordChange::Restored);
        Ok(record)
    }

    /// Permanently remove a trashed record.
    pub async fn purge(&self, kind: EntityKind, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = SqliteRecordRepository::new(db.connection(), kind);
        let record = repo.find(id)?;
        repo.purge(id)?;
        drop(db);
        if let Some(record) = record {
            self.emit(&record, RecordChange::Purged);
        }
        Ok(())
    }

    /// Look a record up by client, remote or unique external ID.
    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<SyncRecord>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection(), kind).find(id)
    }

    pub async fn list(&self, kind: EntityKind, filter: &ListFilter) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection(), kind).list(filter)
    }

    /// Merge one page of remote records.
    pub async fn apply_remote_page(
        &self,
        kind: EntityKind,
        records: &[RemoteRecord],
    ) -> Result<PageApplied> {
        let outcomes = {
            let db = self.db.lock().await;
            let repo = SqliteRecordRepository::new(db.connection(), kind);
            let now = now_ms();
            records
                .iter()
                .map(|record| repo.upsert_remote(record, now))
                .collect::<Result<Vec<_>>>()?
        };

        let mut applied = PageApplied::default();
        for outcome in &outcomes {
            if !outcome.is_change() {
                continue;
            }
            applied.changed += 1;
            if matches!(outcome, UpsertOutcome::Inserted(_)) {
                applied.inserted += 1;
            }
            if let Some(record) = outcome.record() {
                let change = if matches!(outcome, UpsertOutcome::Trashed(_)) {
                    RecordChange::Trashed
                } else {
                    RecordChange::Pulled
                };
                self.emit(record, change);
            }
        }
        Ok(applied)
    }

    /// Oldest queued entries first; `after` resumes past `(pending_since, id)`.
    pub async fn drain_outbox(
        &self,
        limit: usize,
        after: Option<(i64, i64)>,
    ) -> Result<Vec<OutboxEntry>> {
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).drain(limit, after)
    }

    /// Number of queued changes.
    pub async fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).count()
    }

    pub async fn list_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).list(limit)
    }

    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).dead_letters(limit)
    }

    /// List recently resolved sync conflicts.
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).list(limit)
    }

    /// The remote service stored a create or update.
    pub async fn acknowledge_push(
        &self,
        entry: &OutboxEntry,
        remote: &RemoteRecord,
    ) -> Result<Option<SyncRecord>> {
        let record = {
            let db = self.db.lock().await;
            SqliteRecordRepository::new(db.connection(), entry.entity_type)
                .acknowledge_push(entry, remote, now_ms())?
        };
        if let Some(record) = &record {
            self.emit(record, RecordChange::Pushed);
        }
        Ok(record)
    }

    /// The remote service deleted the record.
    pub async fn acknowledge_delete(&self, entry: &OutboxEntry) -> Result<Option<SyncRecord>> {
        let record = {
            let db = self.db.lock().await;
            SqliteRecordRepository::new(db.connection(), entry.entity_type)
                .acknowledge_delete(entry, now_ms())?
        };
        if let Some(record) = &record {
            self.emit(record, RecordChange::Pushed);
        }
        Ok(record)
    }

    /// The remote record behind `entry` is gone; trash the local copy.
    pub async fn mark_remote_missing(&self, entry: &OutboxEntry) -> Result<Option<SyncRecord>> {
        let record = {
            let db = self.db.lock().await;
            SqliteRecordRepository::new(db.connection(), entry.entity_type)
                .mark_remote_missing(entry, now_ms())?
        };
        if let Some(record) = &record {
            self.emit(record, RecordChange::Trashed);
        }
        Ok(record)
    }

    /// Record a failed push attempt. `counts` decides whether it moves the
    /// entry towards abandonment.
    pub async fn record_push_failure(
        &self,
        entry: &OutboxEntry,
        error: &RemoteError,
        counts: bool,
    ) -> Result<()> {
        {
            let db = self.db.lock().await;
            SqliteRecordRepository::new(db.connection(), entry.entity_type)
                .record_push_failure(entry, error, counts, now_ms())?;
        }
        if counts {
            let _ = self.events.send(RecordEvent {
                kind: entry.entity_type,
                client_id: entry.client_id,
                change: RecordChange::Failed,
            });
        }
        Ok(())
    }

    /// Move entries that failed `threshold` times to the dead-letter log and
    /// surface the failure on their records, all in one transaction.
    pub async fn purge_stuck(&self, threshold: u32) -> Result<Vec<OutboxEntry>> {
        let db = self.db.lock().await;
        let now = now_ms();
        let tx = db.connection().unchecked_transaction()?;
        let abandoned = SqliteOutboxRepository::new(&tx).purge_stuck(threshold, now)?;
        for entry in &abandoned {
            SqliteRecordRepository::new(&tx, entry.entity_type).record_abandoned(entry, now)?;
        }
        tx.commit()?;
        drop(db);
        for entry in &abandoned {
            let _ = self.events.send(RecordEvent {
                kind: entry.entity_type,
                client_id: entry.client_id,
                change: RecordChange::Failed,
            });
        }
        Ok(abandoned)
    }

    pub async fn import_progress(&self, kind: EntityKind) -> Result<ImportProgress> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).import_progress(kind)
    }

    pub async fn set_import_progress(
        &self,
        kind: EntityKind,
        progress: &ImportProgress,
    ) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).set_import_progress(
            kind,
            progress,
            now_ms(),
        )
    }

    pub async fn pull_cursor(&self, kind: EntityKind) -> Result<Option<PullCursor>> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).pull_cursor(kind)
    }

    pub async fn set_pull_cursor(&self, kind: EntityKind, cursor: &PullCursor) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).set_pull_cursor(kind, cursor, now_ms())
    }

    pub async fn is_import_complete(&self) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).is_import_complete()
    }

    pub async fn set_import_complete(&self) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).set_import_complete(now_ms())
    }

    /// Forget import and pull progress; the next tick re-imports everything.
    pub async fn reset_sync_state(&self) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).reset()?;
        tracing::info!("Reset import and pull progress");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn local_mutations_emit_events() {
        let service = DatabaseService::open_in_memory().unwrap();
        let mut events = service.subscribe();

        let record = service
            .create(EntityKind::Note, fields(json!({"title": "Standup"})))
            .await
            .unwrap();
        let id = record.client_id.as_str();
        service
            .update(EntityKind::Note, &id, &fields(json!({"body": "notes"})))
            .await
            .unwrap();
        service.delete(EntityKind::Note, &id).await.unwrap();
        service.purge(EntityKind::Note, &id).await.unwrap();

        let mut changes = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.client_id, record.client_id);
            changes.push(event.change);
        }
        assert_eq!(
            changes,
            vec![
                RecordChange::Created,
                RecordChange::Updated,
                RecordChange::Trashed,
                RecordChange::Purged,
            ]
        );
        assert_eq!(service.get(EntityKind::Note, &id).await.unwrap(), None);
        assert_eq!(service.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remote_pages_count_only_real_changes() {
        let service = DatabaseService::open_in_memory().unwrap();
        let page = vec![
            RemoteRecord {
                remote_id: "r1".into(),
                unique_external_id: None,
                fields: fields(json!({"title": "a"})),
                last_edited: 1_000,
                archived: false,
            },
            RemoteRecord {
                remote_id: "r2".into(),
                unique_external_id: None,
                fields: fields(json!({"title": "b"})),
                last_edited: 1_000,
                archived: true,
            },
        ];

        assert_eq!(
            service.apply_remote_page(EntityKind::Task, &page).await.unwrap(),
            PageApplied {
                changed: 1,
                inserted: 1
            }
        );
        assert_eq!(
            service.apply_remote_page(EntityKind::Task, &page).await.unwrap(),
            PageApplied::default()
        );
        let tasks = service
            .list(EntityKind::Task, &ListFilter::default())
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn failed_abandon_leaves_outbox_untouched() {
        let service = DatabaseService::open_in_memory().unwrap();
        service
            .create(EntityKind::Task, fields(json!({"title": "Draft"})))
            .await
            .unwrap();
        let entry = service.drain_outbox(10, None).await.unwrap().remove(0);
        let error = RemoteError::validation("title is required");
        for _ in 0..3 {
            service.record_push_failure(&entry, &error, true).await.unwrap();
        }
        service
            .db
            .lock()
            .await
            .connection()
            .execute_batch("DROP TABLE tasks")
            .unwrap();

        assert!(service.purge_stuck(3).await.is_err());

        assert_eq!(service.pending_count().await.unwrap(), 1);
        assert!(service.list_dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_path_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasksync.db");

        let service = DatabaseService::open_path(&path).unwrap();
        service
            .create(EntityKind::Project, fields(json!({"name": "Launch"})))
            .await
            .unwrap();

        assert!(path.exists());
        assert_eq!(service.pending_count().await.unwrap(), 1);
    }
}
