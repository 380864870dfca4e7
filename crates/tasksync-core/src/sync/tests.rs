use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::config::EngineConfig;
use crate::db::REMOTE_DELETED;
use crate::models::{EntityKind, Fields, ImportPhase, ListFilter, PullCursor, SyncStatus};
use crate::remote::memory::MemoryRemote;
use crate::remote::{ErrorKind, RemoteError, RemoteRecord};
use crate::services::DatabaseService;
use crate::util::now_ms;
use crate::Error;

const DAY_MS: i64 = 24 * 60 * 60 * 1_000;

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap()
}

fn remote_record(remote_id: &str, last_edited: i64, value: serde_json::Value) -> RemoteRecord {
    RemoteRecord {
        remote_id: remote_id.to_string(),
        unique_external_id: None,
        fields: fields(value),
        last_edited,
        archived: false,
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        min_request_interval: Duration::ZERO,
        max_attempts: 3,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
        ..EngineConfig::default()
    }
}

struct Harness {
    db: DatabaseService,
    remote: Arc<MemoryRemote>,
    ctx: SyncContext,
}

fn harness(config: EngineConfig) -> Harness {
    let db = DatabaseService::open_in_memory().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let ctx = SyncContext::new(db.clone(), config).with_adapter(EntityKind::Task, remote.clone());
    Harness { db, remote, ctx }
}

impl Harness {
    /// Seed a record on both sides, as a finished import would have.
    async fn seed(&self, remote_id: &str, last_edited: i64, value: serde_json::Value) {
        let record = remote_record(remote_id, last_edited, value);
        self.remote.insert(record.clone());
        self.db
            .apply_remote_page(EntityKind::Task, &[record])
            .await
            .unwrap();
    }

    async fn all_tasks(&self) -> Vec<crate::models::SyncRecord> {
        let filter = ListFilter {
            include_trashed: true,
            ..ListFilter::default()
        };
        self.db.list(EntityKind::Task, &filter).await.unwrap()
    }
}

#[tokio::test]
async fn offline_created_record_becomes_synced_after_push() {
    let h = harness(config());
    let record = h
        .db
        .create(EntityKind::Task, fields(json!({"title": "Buy milk"})))
        .await
        .unwrap();
    assert_eq!(record.sync_status, SyncStatus::Local);

    let report = push_outbox(&h.ctx).await.unwrap();

    assert_eq!(report.pushed, 1);
    let synced = h
        .db
        .get(EntityKind::Task, &record.client_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert_eq!(synced.remote_id.as_deref(), Some("r1"));
    assert_eq!(h.db.pending_count().await.unwrap(), 0);
    assert_eq!(
        h.remote.get("r1").unwrap().fields.get("title"),
        Some(&json!("Buy milk"))
    );
}

#[tokio::test]
async fn remote_delete_after_local_edit_trashes_without_retry() {
    let h = harness(config());
    h.seed("r7", 1_000, json!({"title": "a"})).await;
    let edited = h
        .db
        .update(EntityKind::Task, "r7", &fields(json!({"title": "b"})))
        .await
        .unwrap();
    h.remote.remove("r7");

    let report = push_outbox(&h.ctx).await.unwrap();

    assert_eq!(report.trashed, 1);
    let record = h
        .db
        .get(EntityKind::Task, &edited.client_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.sync_status, SyncStatus::Trashed);
    assert_eq!(record.sync_error.as_deref(), Some(REMOTE_DELETED));
    assert_eq!(record.remote_id, None);
    assert_eq!(h.db.pending_count().await.unwrap(), 0);

    assert_eq!(push_outbox(&h.ctx).await.unwrap(), PushReport::default());
    assert_eq!(h.remote.calls().update, 1);
}

#[tokio::test]
async fn validation_failures_are_retried_then_abandoned() {
    let h = harness(EngineConfig {
        stuck_threshold: 2,
        ..config()
    });
    let record = h
        .db
        .create(EntityKind::Task, fields(json!({"title": ""})))
        .await
        .unwrap();
    let id = record.client_id.as_str();

    h.remote
        .fail_next(RemoteError::from_status(422, "title is required"));
    let first = push_outbox(&h.ctx).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.abandoned, 0);
    let failed = h.db.get(EntityKind::Task, &id).await.unwrap().unwrap();
    assert_eq!(failed.sync_error.as_deref(), Some("title is required"));

    h.remote
        .fail_next(RemoteError::from_status(422, "title is required"));
    let second = push_outbox(&h.ctx).await.unwrap();
    assert_eq!(second.abandoned, 1);

    assert_eq!(h.db.pending_count().await.unwrap(), 0);
    assert_eq!(h.db.list_dead_letters(10).await.unwrap().len(), 1);
    let abandoned = h.db.get(EntityKind::Task, &id).await.unwrap().unwrap();
    assert!(abandoned
        .sync_error
        .unwrap()
        .starts_with("Gave up on create after 2 attempts"));
}

#[tokio::test(start_paused = true)]
async fn transient_failure_skips_kind_without_counting() {
    let h = harness(config());
    for title in ["first", "second"] {
        h.db.create(EntityKind::Task, fields(json!({ "title": title })))
            .await
            .unwrap();
    }
    for _ in 0..3 {
        h.remote.fail_next(RemoteError::network("connection reset"));
    }

    let report = push_outbox(&h.ctx).await.unwrap();

    assert_eq!(report.pushed, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].1.is_offline());
    assert_eq!(h.remote.calls().create, 3);
    let queued = h.db.list_outbox(10).await.unwrap();
    assert_eq!(queued.len(), 2);
    assert!(queued.iter().all(|entry| entry.retry_count == 0));
    assert!(queued[0].last_error.is_some());
    assert_eq!(queued[1].last_error, None);

    let report = push_outbox(&h.ctx).await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(h.remote.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failing_kind_does_not_block_other_kinds() {
    let h = harness(config());
    let projects = Arc::new(MemoryRemote::new());
    let ctx = h
        .ctx
        .clone()
        .with_adapter(EntityKind::Project, projects.clone());
    h.db.create(EntityKind::Task, fields(json!({"title": "blocked"})))
        .await
        .unwrap();
    h.db.create(EntityKind::Project, fields(json!({"name": "Roadmap"})))
        .await
        .unwrap();
    for _ in 0..3 {
        h.remote.fail_next(RemoteError::from_status(503, "unavailable"));
    }

    let report = push_outbox(&ctx).await.unwrap();

    assert_eq!(report.pushed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, EntityKind::Task);
    assert_eq!(projects.calls().create, 1);
    assert_eq!(projects.len(), 1);
    let queued = h.db.list_outbox(10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].entity_type, EntityKind::Task);
    assert_eq!(queued[0].retry_count, 0);
}

#[tokio::test]
async fn auth_failure_stops_the_whole_push() {
    let h = harness(config());
    let projects = Arc::new(MemoryRemote::new());
    let ctx = h
        .ctx
        .clone()
        .with_adapter(EntityKind::Project, projects.clone());
    h.db.create(EntityKind::Task, fields(json!({"title": "first"})))
        .await
        .unwrap();
    h.db.create(EntityKind::Project, fields(json!({"name": "second"})))
        .await
        .unwrap();
    h.remote.fail_next(RemoteError::auth("token revoked"));

    let error = push_outbox(&ctx).await.unwrap_err();

    assert!(matches!(error, Error::Remote(ref remote) if remote.kind == ErrorKind::Auth));
    assert_eq!(projects.calls().create, 0);
    assert_eq!(h.db.list_outbox(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn deleting_pushed_record_archives_remote_copy() {
    let h = harness(config());
    h.seed("r1", 1_000, json!({"title": "old"})).await;
    let trashed = h.db.delete(EntityKind::Task, "r1").await.unwrap();

    let report = push_outbox(&h.ctx).await.unwrap();

    assert_eq!(report.pushed, 1);
    assert!(h.remote.get("r1").unwrap().archived);
    let record = h
        .db
        .get(EntityKind::Task, &trashed.client_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert!(record.is_trashed());
    assert_eq!(record.remote_id, None);
    assert_eq!(h.db.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn rapid_updates_reach_remote_as_one_call() {
    let h = harness(config());
    let record = h
        .db
        .create(EntityKind::Task, fields(json!({"title": "Plan"})))
        .await
        .unwrap();
    push_outbox(&h.ctx).await.unwrap();
    let id = record.client_id.as_str();

    for patch in [
        json!({"title": "Plan sprint"}),
        json!({"status": "doing"}),
        json!({"due": "2024-07-01"}),
    ] {
        h.db.update(EntityKind::Task, &id, &fields(patch))
            .await
            .unwrap();
    }
    let queued = h.db.list_outbox(10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(
        queued[0].changed_fields.iter().collect::<Vec<_>>(),
        vec!["due", "status", "title"]
    );

    push_outbox(&h.ctx).await.unwrap();

    assert_eq!(h.remote.calls().update, 1);
    let remote = h.remote.get("r1").unwrap();
    assert_eq!(remote.fields.get("title"), Some(&json!("Plan sprint")));
    assert_eq!(remote.fields.get("status"), Some(&json!("doing")));
    assert_eq!(remote.fields.get("due"), Some(&json!("2024-07-01")));
}

#[tokio::test]
async fn bulk_import_resumes_from_persisted_window_and_cursor() {
    let config = EngineConfig {
        import_page_size: 1,
        import_pages_per_slice: 2,
        ..config()
    };
    let h = harness(config.clone());
    let now = now_ms();
    for (remote_id, age) in [
        ("a", DAY_MS / 12),
        ("b", 2 * DAY_MS),
        ("c1", 8 * DAY_MS),
        ("c2", 10 * DAY_MS),
        ("d", 400 * DAY_MS),
    ] {
        h.remote
            .insert(remote_record(remote_id, now - age, json!({ "title": remote_id })));
    }

    run_slice(&h.ctx).await.unwrap();
    let second = run_slice(&h.ctx).await.unwrap();
    assert!(!second.completed);
    let progress = h.db.import_progress(EntityKind::Task).await.unwrap();
    assert_eq!(
        progress.phase,
        ImportPhase::ImportingWindow {
            index: 3,
            cursor: Some("1".into()),
        }
    );
    assert_eq!(progress.imported, 3);

    // A fresh context over the same store picks up where the last one stopped
    let restarted =
        SyncContext::new(h.db.clone(), config).with_adapter(EntityKind::Task, h.remote.clone());
    let mut completed = false;
    for _ in 0..10 {
        if run_slice(&restarted).await.unwrap().completed {
            completed = true;
            break;
        }
    }
    assert!(completed);

    let mut remote_ids = h
        .all_tasks()
        .await
        .into_iter()
        .filter_map(|record| record.remote_id)
        .collect::<Vec<_>>();
    remote_ids.sort();
    assert_eq!(remote_ids, vec!["a", "b", "c1", "c2", "d"]);
    assert_eq!(h.remote.calls().fetch, 11);

    let progress = h.db.import_progress(EntityKind::Task).await.unwrap();
    assert_eq!(progress.imported, 5);
    assert!(progress.abandoned_windows.is_empty());
    assert!(h.db.is_import_complete().await.unwrap());
    let pull = h.db.pull_cursor(EntityKind::Task).await.unwrap().unwrap();
    assert_eq!(Some(pull.since), progress.anchor_ms);
}

#[tokio::test]
async fn timed_out_window_is_abandoned_not_retried() {
    let h = harness(EngineConfig {
        import_pages_per_slice: 20,
        ..config()
    });
    let now = now_ms();
    h.remote
        .insert(remote_record("new", now - DAY_MS / 24, json!({"title": "new"})));
    h.remote
        .insert(remote_record("old", now - 2 * DAY_MS, json!({"title": "old"})));
    h.remote.timeout_when(|filter| filter.edited_before.is_none());

    let report = run_slice(&h.ctx).await.unwrap();

    assert!(report.completed);
    assert_eq!(report.abandoned_windows, 1);
    assert_eq!(h.remote.calls().fetch, IMPORT_WINDOWS.len());
    let tasks = h.all_tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].remote_id.as_deref(), Some("old"));
    let progress = h.db.import_progress(EntityKind::Task).await.unwrap();
    assert_eq!(progress.abandoned_windows, vec![0]);
}

#[tokio::test]
async fn import_stops_at_target_record_count() {
    let h = harness(EngineConfig {
        import_page_size: 2,
        import_target_records: Some(2),
        ..config()
    });
    let now = now_ms();
    for i in 0..5_i64 {
        h.remote.insert(remote_record(
            &format!("r{i}"),
            now - i * 1_000,
            json!({ "title": format!("task {i}") }),
        ));
    }

    let report = run_slice(&h.ctx).await.unwrap();

    assert!(report.completed);
    assert_eq!(report.pages, 1);
    assert_eq!(report.imported, 2);
    assert_eq!(h.remote.calls().fetch, 1);
    assert_eq!(h.all_tasks().await.len(), 2);
    let progress = h.db.import_progress(EntityKind::Task).await.unwrap();
    assert_eq!(progress.phase, ImportPhase::Completed);
    assert_eq!(progress.imported, 2);
    let anchor = progress.anchor_ms.unwrap();
    assert_eq!(
        h.db.pull_cursor(EntityKind::Task).await.unwrap(),
        Some(PullCursor {
            since: anchor,
            cursor: None,
            high_water: anchor,
        })
    );
    assert!(h.db.is_import_complete().await.unwrap());
}

#[tokio::test]
async fn replayed_import_page_is_not_counted_twice() {
    let h = harness(config());
    let now = now_ms();
    let records = ["a", "b", "c"]
        .iter()
        .enumerate()
        .map(|(i, id)| remote_record(id, now - i as i64 * 1_000, json!({ "title": id })))
        .collect::<Vec<_>>();
    for record in &records {
        h.remote.insert(record.clone());
    }
    // The page landed but the process died before progress was saved
    h.db.apply_remote_page(EntityKind::Task, &records[..2])
        .await
        .unwrap();

    let report = run_slice(&h.ctx).await.unwrap();

    assert!(report.completed);
    assert_eq!(report.imported, 1);
    let progress = h.db.import_progress(EntityKind::Task).await.unwrap();
    assert_eq!(progress.imported, 1);
    assert_eq!(h.all_tasks().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_pause_the_import() {
    let h = harness(config());
    for _ in 0..3 {
        h.remote.fail_next(RemoteError::network("connection reset"));
    }

    let error = run_slice(&h.ctx).await.unwrap_err();

    assert!(matches!(error, Error::ImportPaused(_)));
    let progress = h.db.import_progress(EntityKind::Task).await.unwrap();
    assert_eq!(
        progress.phase,
        ImportPhase::ImportingWindow {
            index: 0,
            cursor: None,
        }
    );
    assert!(progress.anchor_ms.is_some());
    assert!(!h.db.is_import_complete().await.unwrap());

    assert!(run_slice(&h.ctx).await.unwrap().completed);
}

#[tokio::test]
async fn pull_applies_pages_and_isolates_kinds() {
    let h = harness(EngineConfig {
        pull_page_size: 1,
        pull_overlap: Duration::from_millis(1_000),
        ..config()
    });
    let notes = Arc::new(MemoryRemote::new());
    let ctx = h.ctx.clone().with_adapter(EntityKind::Note, notes.clone());
    h.db.set_import_complete().await.unwrap();
    let start = PullCursor {
        since: 10_000,
        cursor: None,
        high_water: 10_000,
    };
    for kind in [EntityKind::Task, EntityKind::Note] {
        h.db.set_pull_cursor(kind, &start).await.unwrap();
    }
    h.remote
        .insert(remote_record("r0", 5_000, json!({"title": "too old"})));
    h.remote
        .insert(remote_record("r1", 9_500, json!({"title": "in overlap"})));
    h.remote
        .insert(remote_record("r2", 20_000, json!({"title": "new"})));
    notes.fail_next(RemoteError::auth("bad token"));

    let report = pull_all(&ctx).await.unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(report.changed, 2);
    assert_eq!(
        report.failures,
        vec![(EntityKind::Note, RemoteError::auth("bad token"))]
    );
    assert_eq!(h.all_tasks().await.len(), 2);
    assert_eq!(
        h.db.pull_cursor(EntityKind::Task).await.unwrap(),
        Some(PullCursor {
            since: 20_000,
            cursor: None,
            high_water: 20_000,
        })
    );
    assert_eq!(
        h.db.pull_cursor(EntityKind::Note).await.unwrap(),
        Some(start)
    );
}

#[tokio::test]
async fn pull_keeps_pending_local_edit() {
    let h = harness(config());
    h.seed("r1", 1_000, json!({"title": "a", "status": "todo"})).await;
    h.db.set_import_complete().await.unwrap();
    h.db.set_pull_cursor(EntityKind::Task, &PullCursor::default())
        .await
        .unwrap();
    h.db.update(EntityKind::Task, "r1", &fields(json!({"title": "mine"})))
        .await
        .unwrap();
    h.remote.insert(remote_record(
        "r1",
        2_000,
        json!({"title": "theirs", "status": "done"}),
    ));

    pull_all(&h.ctx).await.unwrap();

    let record = h.db.get(EntityKind::Task, "r1").await.unwrap().unwrap();
    assert_eq!(record.fields.get("title"), Some(&json!("mine")));
    assert_eq!(record.fields.get("status"), Some(&json!("done")));
    assert_eq!(record.sync_status, SyncStatus::Pending);
    assert_eq!(h.db.list_conflicts(10).await.unwrap().len(), 1);
}
