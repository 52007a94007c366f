use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use todosync_core::markdown::{parse_tasks, serialize_tasks};
use todosync_core::{ConflictPolicy, Priority, SyncConfig, SyncDirection, SyncStrategy, Task, TaskStatus};
use todosync_sync::backup::list_backups;
use todosync_sync::diff::content_digest;
use todosync_sync::state::StateSnapshot;
use todosync_sync::{
    CoordinatorState, ManualWatcher, MemoryDatabase, MemoryFileSystem, MemoryStateBackend, Side,
    SyncCoordinator, SyncDependencies, SyncError, SyncEvent, SyncOutcome, SyncState,
};

const TODO: &str = "/work/TODO.md";

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-10-19T09:00:00Z")
        .expect("timestamp")
        .with_timezone(&Utc)
}

fn config() -> SyncConfig {
    let mut config = SyncConfig::new(TODO);
    config.auto_backup = false;
    config.debounce_ms = 100;
    config.throttle_ms = 0;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 1_000;
    config
}

struct Harness {
    fs: Arc<MemoryFileSystem>,
    db: Arc<MemoryDatabase>,
    state: Arc<MemoryStateBackend>,
    watcher: Arc<ManualWatcher>,
    coordinator: SyncCoordinator,
}

fn harness(config: SyncConfig) -> Harness {
    harness_with_state(config, MemoryStateBackend::new())
}

fn harness_with_state(config: SyncConfig, state: MemoryStateBackend) -> Harness {
    let fs = Arc::new(MemoryFileSystem::new());
    let db = Arc::new(MemoryDatabase::new());
    let state = Arc::new(state);
    let watcher = Arc::new(ManualWatcher::new());
    let coordinator = SyncCoordinator::new(
        config,
        SyncDependencies {
            fs: fs.clone(),
            db: db.clone(),
            state: state.clone(),
            watcher: Some(watcher.clone()),
        },
    );
    Harness {
        fs,
        db,
        state,
        watcher,
        coordinator,
    }
}

impl Harness {
    fn write_file(&self, tasks: &[Task]) {
        self.fs.insert(TODO, serialize_tasks(tasks));
    }

    fn file(&self) -> String {
        self.fs.contents(Path::new(TODO)).expect("todo file")
    }

    fn file_tasks(&self) -> Vec<Task> {
        parse_tasks(&self.file(), Utc::now()).expect("parse todo file")
    }
}

fn ids(tasks: &[Task]) -> Vec<&str> {
    tasks.iter().map(|t| t.id.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_rejects_unsafe_path_and_stays_stopped() {
    let mut config = config();
    config.todo_path = "../outside/TODO.md".into();
    let h = harness(config);

    let err = h.coordinator.start().await.unwrap_err();
    assert!(matches!(err, SyncError::PathTraversal { .. }), "got {err:?}");
    assert_eq!(h.coordinator.state(), CoordinatorState::Stopped);
    assert!(!h.watcher.is_watching());
}

#[tokio::test]
async fn syncing_requires_a_started_coordinator() {
    let h = harness(config());
    let err = h.coordinator.sync_file_to_app().await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidState { .. }));
}

#[tokio::test]
async fn start_then_stop_unregisters_the_watcher() {
    let h = harness(config());
    h.coordinator.start().await.expect("start");
    assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
    assert!(h.watcher.is_watching());

    let err = h.coordinator.start().await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidState { .. }));

    h.coordinator.stop().await;
    assert_eq!(h.coordinator.state(), CoordinatorState::Stopped);
    assert!(!h.watcher.is_watching());
}

#[tokio::test]
async fn app_to_file_only_does_not_watch() {
    let mut config = config();
    config.direction = SyncDirection::AppToFile;
    let h = harness(config);
    h.coordinator.start().await.expect("start");
    assert!(!h.watcher.is_watching());
}

#[tokio::test(start_paused = true)]
async fn error_state_clears_after_cooldown() {
    let mut config = config();
    config.error_cooldown_ms = 5_000;
    let h = harness(config);
    h.coordinator.start().await.expect("start");
    h.write_file(&[Task::new("T-1", "Buy milk", t0())]);
    h.fs.fail_reads(1, std::io::ErrorKind::PermissionDenied);

    assert!(h.coordinator.sync_file_to_app().await.is_err());
    assert_eq!(h.coordinator.state().name(), "error");

    tokio::time::sleep(StdDuration::from_millis(5_100)).await;
    assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
}

#[tokio::test]
async fn unfinished_sync_forces_a_full_pass_on_start() {
    let task = Task::new("T-1", "Buy milk", t0());
    let content = serialize_tasks(&[task]);
    let state = MemoryStateBackend::with_snapshot(StateSnapshot {
        sync: SyncState {
            last_file_hash: Some(content_digest(&content)),
            last_synced_at: Some(t0()),
            pending: true,
        },
        ..StateSnapshot::default()
    });
    let h = harness_with_state(config(), state);
    h.fs.insert(TODO, content);
    h.coordinator.start().await.expect("start");

    let report = h.coordinator.sync_file_to_app().await.expect("sync");
    assert_eq!(report.tasks_written, 1);
    assert!(h.db.task("T-1").is_some());
    assert!(!h.state.stored().sync.pending);
}

// ---------------------------------------------------------------------------
// File → app
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_sync_without_file_change_writes_nothing() {
    let h = harness(config());
    h.coordinator.start().await.expect("start");
    h.write_file(&[Task::new("T-1", "Buy milk", t0()), Task::new("T-2", "Buy bread", t0())]);

    let first = h.coordinator.sync_file_to_app().await.expect("first sync");
    assert_eq!(first.tasks_written, 2);
    let commits = h.db.commit_count();
    let transactions = h.db.transaction_count();

    let second = h.coordinator.sync_file_to_app().await.expect("second sync");
    assert_eq!(second.outcome, SyncOutcome::NoChange);
    assert_eq!(h.db.commit_count(), commits);
    assert_eq!(h.db.transaction_count(), transactions);
}

#[tokio::test]
async fn failed_batch_leaves_store_and_bases_untouched() {
    let h = harness(config());
    h.coordinator.start().await.expect("start");
    h.write_file(&[
        Task::new("a", "One", t0()),
        Task::new("b", "Two", t0()),
        Task::new("c", "Three", t0()),
    ]);
    h.db.fail_upsert_of("b");

    let err = h.coordinator.sync_file_to_app().await.unwrap_err();
    let SyncError::BatchAborted { report, .. } = &err else {
        panic!("expected BatchAborted, got {err:?}");
    };
    assert!(!report.committed);
    assert_eq!(report.failed(), 1);

    assert!(h.db.snapshot().is_empty());
    assert!(h.coordinator.base_version(&"a".into()).is_none());
    assert!(h.coordinator.sync_state().last_file_hash.is_none());

    h.db.clear_faults();
    let retry = h.coordinator.sync_file_to_app().await.expect("retry after fault cleared");
    assert_eq!(retry.tasks_written, 3);
}

#[tokio::test]
async fn parse_error_skips_the_cycle_and_leaves_the_file() {
    let h = harness(config());
    h.coordinator.start().await.expect("start");
    let broken = "# Tasks\n\n- [ ] `T-1` Buy milk\n  - colour: red\n";
    h.fs.insert(TODO, broken);
    let mut events = h.coordinator.subscribe();

    let err = h.coordinator.sync_file_to_app().await.unwrap_err();
    assert!(matches!(err, SyncError::Parse { line: 4, .. }), "got {err:?}");
    assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
    assert_eq!(h.file(), broken);
    assert_eq!(h.fs.write_count(), 0);

    let history = h.coordinator.history(1);
    assert_eq!(history[0].outcome, SyncOutcome::Failed);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SyncEvent::SyncError { .. }), "parse errors are not surfaced");
    }
}

#[tokio::test]
async fn oversized_file_is_rejected() {
    let mut config = config();
    config.max_tasks = 1;
    let h = harness(config);
    h.coordinator.start().await.expect("start");
    h.write_file(&[Task::new("a", "One", t0()), Task::new("b", "Two", t0())]);

    let err = h.coordinator.sync_file_to_app().await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert!(h.db.snapshot().is_empty());
}

#[tokio::test]
async fn removing_a_line_deletes_the_task() {
    let h = harness(config());
    h.coordinator.start().await.expect("start");
    let keep = Task::new("keep", "Keep", t0());
    let gone = Task::new("gone", "Gone", t0());
    h.write_file(&[keep.clone(), gone]);
    h.coordinator.sync_file_to_app().await.expect("import");

    h.write_file(&[keep]);
    let report = h.coordinator.sync_file_to_app().await.expect("sync");

    assert_eq!(report.tasks_deleted, 1);
    assert_eq!(ids(&h.db.snapshot()), ["keep"]);
    assert!(h.coordinator.base_version(&"gone".into()).is_none());
}

#[tokio::test]
async fn last_write_wins_strategy_takes_the_newer_task() {
    let mut config = config();
    config.strategy = SyncStrategy::LastWriteWins;
    let h = harness(config);
    let base = Task::new("T-1", "Plan", t0());
    h.db.seed([base.clone()]);
    h.write_file(&[base.clone()]);
    h.coordinator.start().await.expect("start");
    h.coordinator.sync_file_to_app().await.expect("initial");

    let mut file = base.clone();
    file.title = "Plan (file)".into();
    file.updated_at = t0() + Duration::minutes(1);
    h.write_file(&[file]);
    let mut app = base.clone();
    app.title = "Plan (app)".into();
    app.updated_at = t0() + Duration::minutes(2);
    h.db.seed([app]);

    let report = h.coordinator.sync_file_to_app().await.expect("sync");
    assert!(report.conflicts.is_empty());
    assert_eq!(h.db.task("T-1").expect("task").title, "Plan (app)");
    // Bidirectional: the file is refreshed with the winning version.
    assert_eq!(h.file_tasks()[0].title, "Plan (app)");
}

// ---------------------------------------------------------------------------
// App → file
// ---------------------------------------------------------------------------

#[tokio::test]
async fn app_tasks_keep_file_order_and_new_ones_are_appended() {
    let h = harness(config());
    let b = Task::new("b", "Second", t0());
    let a = Task::new("a", "First", t0());
    h.write_file(&[b.clone(), a.clone()]);
    h.db.seed([a, b, Task::new("c", "Third", t0() + Duration::minutes(1))]);
    h.coordinator.start().await.expect("start");

    let reports = h.coordinator.sync().await.expect("sync");
    assert_eq!(reports.len(), 2);
    assert_eq!(ids(&h.file_tasks()), ["b", "a", "c"]);
    assert!(h.coordinator.base_version(&"c".into()).is_some());
}

#[tokio::test]
async fn unsynced_file_edits_are_imported_before_writing() {
    let h = harness(config());
    let task = Task::new("T-1", "Draft", t0());
    h.db.seed([task.clone()]);
    h.write_file(&[task.clone()]);
    h.coordinator.start().await.expect("start");
    h.coordinator.sync().await.expect("initial");

    let mut edited = task.clone();
    edited.status = TaskStatus::Done;
    edited.updated_at = t0() + Duration::minutes(5);
    h.write_file(&[edited]);
    h.db.seed([Task::new("T-2", "From app", t0() + Duration::minutes(1))]);

    h.coordinator.sync_app_to_file().await.expect("sync");

    let file = h.file_tasks();
    assert_eq!(ids(&file), ["T-1", "T-2"]);
    assert_eq!(file[0].status, TaskStatus::Done);
    assert_eq!(h.db.task("T-1").expect("T-1").status, TaskStatus::Done);
}

#[tokio::test]
async fn backups_are_pruned_to_the_limit() {
    let mut config = config();
    config.direction = SyncDirection::AppToFile;
    config.auto_backup = true;
    config.max_backups = 2;
    let h = harness(config);
    h.write_file(&[]);
    h.coordinator.start().await.expect("start");

    for i in 0..4 {
        h.db.seed([Task::new(format!("T-{i}"), format!("Task {i}"), t0())]);
        h.coordinator.sync_app_to_file().await.expect("sync");
        // Backup names carry millisecond timestamps.
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }

    let backups = list_backups(h.fs.as_ref(), Path::new(TODO)).await.expect("list");
    assert_eq!(backups.len(), 2);
    assert_eq!(h.file_tasks().len(), 4);
}

#[tokio::test]
async fn preview_shows_the_diff_without_writing() {
    let h = harness(config());
    let task = Task::new("T-1", "Buy milk", t0());
    h.write_file(&[task.clone()]);
    let mut done = task.clone();
    done.status = TaskStatus::Done;
    h.db.seed([done]);
    h.coordinator.start().await.expect("start");
    let before = h.file();

    let preview = h.coordinator.preview_app_to_file().await.expect("preview");

    let diff = preview.unified_diff.expect("diff");
    assert!(diff.contains("-- [ ] `T-1` Buy milk"));
    assert!(diff.contains("+- [x] `T-1` Buy milk"));
    assert_eq!(preview.tasks, 1);
    assert_eq!(h.file(), before);
    assert_eq!(h.fs.write_count(), 0);
}

// ---------------------------------------------------------------------------
// Manual conflicts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn manual_conflict_waits_for_resolution() {
    let mut config = config();
    config.conflict_resolution = ConflictPolicy::Manual;
    let h = harness(config);
    let base = Task::new("T-1", "Write report", t0());
    let other = Task::new("T-2", "Other", t0());
    h.db.seed([base.clone(), other.clone()]);
    h.write_file(&[base.clone(), other.clone()]);
    h.coordinator.start().await.expect("start");
    h.coordinator.sync().await.expect("initial");

    let mut file = base.clone();
    file.priority = Priority::High;
    h.write_file(&[file, other]);
    let mut app = base.clone();
    app.priority = Priority::Low;
    h.db.seed([app]);

    let report = h.coordinator.sync_file_to_app().await.expect("sync");
    assert_eq!(report.pending_conflicts, 1);
    assert_eq!(h.coordinator.conflicts().len(), 1);
    assert_eq!(h.db.task("T-1").expect("T-1").priority, Priority::Low);
    assert_eq!(h.file_tasks()[0].priority, Priority::High);

    // Writing the file keeps the file's side of the conflict.
    h.coordinator.sync_app_to_file().await.expect("app to file");
    assert_eq!(h.file_tasks()[0].priority, Priority::High);
    assert_eq!(h.state.stored().conflicts.len(), 1);

    let resolved = h
        .coordinator
        .resolve_conflict(&"T-1".into(), Side::App)
        .await
        .expect("resolve");
    assert!(!resolved.is_pending());
    assert!(h.coordinator.conflicts().is_empty());
    assert_eq!(h.db.task("T-1").expect("T-1").priority, Priority::Low);
    assert_eq!(h.file_tasks()[0].priority, Priority::Low);
    let base = h.coordinator.base_version(&"T-1".into()).expect("base");
    assert_eq!(base.snapshot.priority, Priority::Low);
}

#[tokio::test]
async fn resolving_an_unknown_conflict_fails() {
    let h = harness(config());
    h.coordinator.start().await.expect("start");
    let err = h
        .coordinator
        .resolve_conflict(&"nope".into(), Side::File)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownConflict { .. }));
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn burst_of_file_events_runs_one_sync() {
    let h = harness(config());
    h.coordinator.start().await.expect("start");
    let mut events = h.coordinator.subscribe();

    h.write_file(&[Task::new("T-1", "Buy milk", t0())]);
    for _ in 0..3 {
        assert!(h.watcher.trigger());
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    let report = tokio::time::timeout(StdDuration::from_secs(5), async {
        loop {
            if let Ok(SyncEvent::SyncCompleted(report)) = events.recv().await {
                break report;
            }
        }
    })
    .await
    .expect("sync completed");
    assert_eq!(report.direction, SyncDirection::FileToApp);
    assert_eq!(report.tasks_written, 1);

    tokio::time::sleep(StdDuration::from_secs(1)).await;
    assert_eq!(h.coordinator.history(10).len(), 1);
    assert!(h.db.task("T-1").is_some());

    h.coordinator.stop().await;
}

// ---------------------------------------------------------------------------
// File codec edge cases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hash_words_in_store_titles_are_not_read_back_as_labels() {
    let h = harness(config());
    h.db.seed([
        Task::new("T-0", "Water plants", t0()),
        Task::new("T-1", "Fix issue #42", t0()),
    ]);
    h.coordinator.start().await.expect("start");
    h.coordinator.sync().await.expect("initial sync");
    assert!(h.file().contains("`T-1` Fix issue \\#42\n"));

    let mut edited = h.file_tasks();
    let plants = edited.iter_mut().find(|t| t.id.as_str() == "T-0").expect("T-0 in file");
    plants.title = "Water all plants".into();
    h.write_file(&edited);
    h.coordinator.sync_file_to_app().await.expect("import edit");

    let stored = h.db.task("T-1").expect("T-1 kept");
    assert_eq!(stored.title, "Fix issue #42");
    assert!(stored.labels.is_empty());
    assert_eq!(h.db.task("T-0").expect("T-0").title, "Water all plants");
}

#[tokio::test]
async fn unwritable_store_task_never_reaches_the_file() {
    let h = harness(config());
    h.write_file(&[Task::new("T-0", "Water plants", t0())]);
    h.coordinator.start().await.expect("start");
    h.coordinator.sync_file_to_app().await.expect("import");
    h.db.seed([Task::new("T-1", "   ", t0())]);
    let before = h.file();

    let err = h.coordinator.sync_app_to_file().await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(ref m) if m.contains("T-1")), "got {err:?}");
    assert_eq!(h.file(), before);
    assert_eq!(h.coordinator.state(), CoordinatorState::Idle);

    // The file stays readable, so file syncs keep working.
    assert_eq!(ids(&h.file_tasks()), vec!["T-0"]);
    let result = h.coordinator.sync_file_to_app().await;
    assert!(!matches!(result, Err(SyncError::Parse { .. })), "got {result:?}");
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

async fn next_completion(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> tokio::time::Instant {
    tokio::time::timeout(StdDuration::from_secs(30), async {
        loop {
            if let Ok(SyncEvent::SyncCompleted(_)) = events.recv().await {
                break tokio::time::Instant::now();
            }
        }
    })
    .await
    .expect("sync completed")
}

#[tokio::test(start_paused = true)]
async fn skipped_sync_after_cooldown_still_returns_to_idle() {
    let mut config = config();
    config.error_cooldown_ms = 250;
    let h = harness(config);
    h.coordinator.start().await.expect("start");
    h.write_file(&[Task::new("T-1", "Buy milk", t0())]);
    h.fs.fail_reads(1, std::io::ErrorKind::PermissionDenied);
    assert!(h.coordinator.sync_file_to_app().await.is_err());
    assert_eq!(h.coordinator.state().name(), "error");

    // Outlasts the cooldown, then fails without surfacing.
    h.fs.insert(TODO, "- [ ] `a` One\n  - colour: red\n");
    h.fs.slow_reads(StdDuration::from_millis(400));
    let err = h.coordinator.sync_file_to_app().await.unwrap_err();
    assert!(matches!(err, SyncError::Parse { .. }));

    tokio::time::sleep(StdDuration::from_secs(60)).await;
    assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn file_triggered_syncs_respect_the_throttle() {
    let mut config = config();
    config.throttle_ms = 2_000;
    let h = harness(config);
    h.coordinator.start().await.expect("start");
    let mut events = h.coordinator.subscribe();

    h.write_file(&[Task::new("T-1", "Buy milk", t0())]);
    assert!(h.watcher.trigger());
    let first = next_completion(&mut events).await;

    h.write_file(&[Task::new("T-1", "Buy oat milk", t0())]);
    assert!(h.watcher.trigger());
    let second = next_completion(&mut events).await;

    assert!(
        second - first >= StdDuration::from_millis(1_900),
        "second sync ran {:?} after the first",
        second - first
    );
    assert_eq!(h.db.task("T-1").expect("T-1").title, "Buy oat milk");
    h.coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn events_during_a_sync_collapse_into_one_follow_up() {
    let h = harness(config());
    h.coordinator.start().await.expect("start");
    h.write_file(&[Task::new("T-1", "Buy milk", t0())]);
    h.fs.slow_reads(StdDuration::from_millis(500));

    assert!(h.watcher.trigger());
    tokio::time::sleep(StdDuration::from_millis(200)).await;
    assert_eq!(h.coordinator.state(), CoordinatorState::Syncing);
    for _ in 0..3 {
        assert!(h.watcher.trigger());
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    tokio::time::sleep(StdDuration::from_secs(5)).await;
    assert_eq!(h.coordinator.history(10).len(), 2);
    h.coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_the_sync_in_flight() {
    let h = harness(config());
    h.coordinator.start().await.expect("start");
    h.write_file(&[Task::new("T-1", "Buy milk", t0())]);
    h.fs.slow_reads(StdDuration::from_millis(500));

    assert!(h.watcher.trigger());
    tokio::time::sleep(StdDuration::from_millis(200)).await;
    assert_eq!(h.coordinator.state(), CoordinatorState::Syncing);

    h.coordinator.stop().await;
    assert_eq!(h.coordinator.state(), CoordinatorState::Stopped);
    assert!(h.db.task("T-1").is_some());
    let history = h.coordinator.history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, SyncOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn stop_gives_up_on_a_stuck_sync_after_its_timeout() {
    let mut config = config();
    config.stop_timeout_ms = 200;
    let h = harness(config);
    h.coordinator.start().await.expect("start");
    h.write_file(&[Task::new("T-1", "Buy milk", t0())]);
    h.fs.slow_reads(StdDuration::from_secs(30));

    assert!(h.watcher.trigger());
    tokio::time::sleep(StdDuration::from_millis(200)).await;

    let started = tokio::time::Instant::now();
    h.coordinator.stop().await;
    assert!(started.elapsed() < StdDuration::from_secs(1), "stop took {:?}", started.elapsed());
    assert_eq!(h.coordinator.state(), CoordinatorState::Stopped);

    tokio::time::sleep(StdDuration::from_secs(60)).await;
    assert_eq!(h.coordinator.state(), CoordinatorState::Stopped);
}
