use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use filetime::{set_file_mtime, FileTime};
use tempfile::TempDir;
use todosync_core::markdown::{parse_tasks, serialize_tasks};
use todosync_core::{SyncConfig, Task, TaskStatus};
use todosync_sync::backup::list_backups;
use todosync_sync::{
    Database, JsonFileDatabase, JsonStateBackend, LocalFileSystem, SyncCoordinator,
    SyncDependencies, SyncOutcome,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).single().expect("timestamp")
}

struct Disk {
    _dir: TempDir,
    todo: PathBuf,
    tasks: PathBuf,
    state: PathBuf,
}

fn disk() -> Disk {
    let dir = TempDir::new().expect("tempdir");
    let todo = dir.path().join("TODO.md");
    let tasks = dir.path().join("store").join("tasks.json");
    let state = dir.path().join("store").join("state.json");
    Disk {
        _dir: dir,
        todo,
        tasks,
        state,
    }
}

async fn open(disk: &Disk, auto_backup: bool) -> (SyncCoordinator, Arc<JsonFileDatabase>) {
    let mut config = SyncConfig::new(&disk.todo);
    config.auto_backup = auto_backup;
    let db = Arc::new(JsonFileDatabase::open(&disk.tasks).await.expect("open store"));
    let coordinator = SyncCoordinator::new(
        config,
        SyncDependencies {
            fs: Arc::new(LocalFileSystem::new()),
            db: db.clone(),
            state: Arc::new(JsonStateBackend::new(&disk.state)),
            watcher: None,
        },
    );
    coordinator.start().await.expect("start");
    (coordinator, db)
}

fn read_tasks(path: &Path) -> Vec<Task> {
    let content = fs::read_to_string(path).expect("read todo");
    parse_tasks(&content, Utc::now()).expect("parse todo")
}

#[tokio::test]
async fn file_import_survives_a_restart() {
    let disk = disk();
    fs::write(
        &disk.todo,
        serialize_tasks(&[Task::new("T-1", "Buy milk", t0()), Task::new("T-2", "Call mum", t0())]),
    )
    .expect("seed todo");

    let (coordinator, db) = open(&disk, false).await;
    let report = coordinator.sync_file_to_app().await.expect("import");
    assert_eq!(report.tasks_written, 2);
    assert_eq!(db.get_all().await.expect("get_all").len(), 2);
    coordinator.stop().await;
    assert!(disk.state.exists());

    // A fresh process sees the recorded file hash and does nothing.
    let (coordinator, db) = open(&disk, false).await;
    assert_eq!(db.get_all().await.expect("get_all").len(), 2);
    let report = coordinator.sync_file_to_app().await.expect("second import");
    assert_eq!(report.outcome, SyncOutcome::NoChange);
    assert!(coordinator.base_version(&"T-2".into()).is_some());
}

#[tokio::test]
async fn hand_edit_takes_the_file_mtime() {
    let disk = disk();
    let milk = Task::new("T-1", "Buy milk", t0());
    fs::write(&disk.todo, serialize_tasks(&[milk.clone()])).expect("seed todo");
    let (coordinator, db) = open(&disk, false).await;
    coordinator.sync_file_to_app().await.expect("import");

    let mut ticked = milk.clone();
    ticked.status = TaskStatus::Done;
    fs::write(&disk.todo, serialize_tasks(&[ticked])).expect("edit todo");
    let edited_at = Utc.with_ymd_and_hms(2026, 10, 19, 12, 30, 0).single().expect("timestamp");
    set_file_mtime(&disk.todo, FileTime::from_unix_time(edited_at.timestamp(), 0)).expect("set mtime");

    coordinator.sync_file_to_app().await.expect("sync");

    let stored = db.get(&"T-1".into()).await.expect("get").expect("T-1");
    assert_eq!(stored.status, TaskStatus::Done);
    assert_eq!(stored.updated_at, edited_at);
}

#[tokio::test]
async fn app_changes_are_written_atomically_with_a_backup() {
    let disk = disk();
    let original = serialize_tasks(&[Task::new("T-1", "Buy milk", t0())]);
    fs::write(&disk.todo, &original).expect("seed todo");
    let (coordinator, db) = open(&disk, true).await;
    coordinator.sync_file_to_app().await.expect("import");

    let mut renamed = db.get(&"T-1".into()).await.expect("get").expect("T-1");
    renamed.title = "Buy oat milk".into();
    renamed.updated_at = Utc::now();
    db.update(renamed).await.expect("update");
    db.create(Task::new("T-2", "Water plants", Utc::now())).await.expect("create");

    let report = coordinator.sync_app_to_file().await.expect("write file");

    let titles: Vec<String> = read_tasks(&disk.todo).into_iter().map(|t| t.title).collect();
    assert_eq!(titles, ["Buy oat milk", "Water plants"]);
    let backup = report.backup.expect("backup taken");
    assert_eq!(fs::read_to_string(&backup).expect("read backup"), original);

    let fs_impl = LocalFileSystem::new();
    let backups = list_backups(&fs_impl, &disk.todo).await.expect("list backups");
    assert_eq!(backups, [backup]);
    let leftovers: Vec<_> = fs::read_dir(disk.todo.parent().expect("parent"))
        .expect("read dir")
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
}
