//! The sync coordinator: lifecycle, the file-change event loop, and both
//! sync directions.
//!
//! ```text
//! watcher ──FileEvent──▶ event loop ──debounce/throttle──▶ file → app
//!                                                            │
//!   read · parse · diff · merge · resolve · batch commit · base versions
//!                                                            │
//!                          (bidirectional) app → file ◀──────┘
//! ```
//!
//! Every cycle runs under one async mutex, so at most one sync is in flight.
//! File I/O and store calls go through the retry policy and a circuit
//! breaker per guarded operation.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use todosync_core::markdown::{check_serializable, parse_tasks, serialize_tasks};
use todosync_core::{SyncConfig, SyncDirection, SyncStrategy, Task, TaskId};

use crate::backup::{create_backup, prune_backups};
use crate::batch::{BatchWriter, TaskMutation};
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::conflict::{take_side, ConflictResolver, ResolutionOutcome};
use crate::db::Database;
use crate::diff::{content_digest, DiffDetector};
use crate::error::SyncError;
use crate::events::{CoordinatorState, SyncEvent, SyncOutcome, SyncReport};
use crate::fs::FileSystem;
use crate::merge::{last_write_wins, Conflict, MergeOutcome, Resolution, Side, TaskVersion, ThreeWayMerger};
use crate::preview::{unified_diff, Preview};
use crate::retry::RetryPolicy;
use crate::state::{BaseVersion, StateBackend, SyncState, SyncStateManager};
use crate::stats::{HistoryEntry, StatsRecorder, SyncStatistics};
use crate::watcher::{FileEvent, FileWatcher, WatchGuard};

const EVENT_CAPACITY: usize = 256;

/// Collaborators handed to [`SyncCoordinator::new`].
pub struct SyncDependencies {
    pub fs: Arc<dyn FileSystem>,
    pub db: Arc<dyn Database>,
    pub state: Arc<dyn StateBackend>,
    /// `None` disables the event loop; syncs then run only on request.
    pub watcher: Option<Arc<dyn FileWatcher>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStates {
    pub file_read: BreakerState,
    pub file_write: BreakerState,
    pub db_read: BreakerState,
    pub db_write: BreakerState,
}

struct Breakers {
    file_read: CircuitBreaker,
    file_write: CircuitBreaker,
    db_read: CircuitBreaker,
    db_write: CircuitBreaker,
}

struct Running {
    watch: WatchGuard,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// What one direction did, before timing and bookkeeping.
#[derive(Default)]
struct CycleWork {
    changed: bool,
    tasks_written: usize,
    tasks_deleted: usize,
    conflicts: Vec<Conflict>,
    backup: Option<PathBuf>,
    file_outdated: bool,
}

/// The file as an app-to-file sync would write it.
struct Rendering {
    tasks: Vec<Task>,
    content: String,
    existing: Option<String>,
    previous: BTreeMap<TaskId, Task>,
    pending: BTreeMap<TaskId, Conflict>,
}

/// Keeps one Markdown file and one task store in agreement.
///
/// Cheap to clone; clones share the same coordinator.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: SyncConfig,
    fs: Arc<dyn FileSystem>,
    db: Arc<dyn Database>,
    watcher: Option<Arc<dyn FileWatcher>>,
    state: SyncStateManager,
    diff: DiffDetector,
    merger: ThreeWayMerger,
    resolver: ConflictResolver,
    retry: RetryPolicy,
    breakers: Breakers,
    batch: BatchWriter,
    sync_lock: tokio::sync::Mutex<()>,
    lifecycle: tokio::sync::Mutex<()>,
    status: Arc<watch::Sender<CoordinatorState>>,
    events: broadcast::Sender<SyncEvent>,
    recorder: Mutex<StatsRecorder>,
    running: Mutex<Option<Running>>,
    /// Skip the unchanged-file shortcut on the next file sync.
    force_full: AtomicBool,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl SyncCoordinator {
    pub fn new(config: SyncConfig, deps: SyncDependencies) -> Self {
        let (status, _) = watch::channel(CoordinatorState::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let settings = &config.circuit_breaker;
        let inner = Inner {
            diff: DiffDetector::new(config.include_timestamps_in_hash),
            merger: ThreeWayMerger::new(),
            resolver: ConflictResolver::new(config.conflict_resolution),
            retry: RetryPolicy::new(&config.retry),
            breakers: Breakers {
                file_read: CircuitBreaker::new("file_read", settings),
                file_write: CircuitBreaker::new("file_write", settings),
                db_read: CircuitBreaker::new("db_read", settings),
                db_write: CircuitBreaker::new("db_write", settings),
            },
            batch: BatchWriter::new(Arc::clone(&deps.db)),
            state: SyncStateManager::new(deps.state),
            fs: deps.fs,
            db: deps.db,
            watcher: deps.watcher,
            sync_lock: tokio::sync::Mutex::new(()),
            lifecycle: tokio::sync::Mutex::new(()),
            status: Arc::new(status),
            events,
            recorder: Mutex::new(StatsRecorder::new(config.history_limit)),
            running: Mutex::new(None),
            force_full: AtomicBool::new(false),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Validate the config, load sync state, register the watcher, and go
    /// `Idle`. Any failure leaves the coordinator `Stopped`.
    pub async fn start(&self) -> Result<(), SyncError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let current = self.state();
        if current != CoordinatorState::Stopped {
            return Err(SyncError::InvalidState {
                expected: "stopped",
                actual: current.to_string(),
            });
        }
        self.inner.set_status(CoordinatorState::Starting);

        let running = match self.inner.prepare().await {
            Ok(()) => self.spawn_event_loop(),
            Err(err) => Err(err),
        };
        match running {
            Ok(running) => {
                *self.inner.running.lock() = running;
                self.inner.set_status(CoordinatorState::Idle);
                info!(
                    path = %self.inner.config.todo_path.display(),
                    direction = %self.inner.config.direction,
                    "sync coordinator started"
                );
                Ok(())
            }
            Err(err) => {
                self.inner.set_status(CoordinatorState::Stopped);
                error!(error = %err, "sync coordinator failed to start");
                Err(err)
            }
        }
    }

    /// Unregister the watcher, wait up to `stop_timeout` for an in-flight
    /// sync, and go `Stopped`. A sync still running at the deadline is left
    /// to finish on its own; it is never cancelled mid-commit.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.state() == CoordinatorState::Stopped {
            return;
        }
        let wait = self.inner.config.stop_timeout();
        let running = self.inner.running.lock().take();
        if let Some(Running {
            watch,
            shutdown,
            handle,
        }) = running
        {
            drop(watch);
            let _ = shutdown.send(());
            match timeout(wait, handle).await {
                Ok(joined) => handle_join(joined),
                Err(_) => warn!(
                    timeout_ms = wait.as_millis() as u64,
                    "event loop still syncing at stop deadline"
                ),
            }
        }
        if timeout(wait, self.inner.sync_lock.lock()).await.is_err() {
            warn!(
                timeout_ms = wait.as_millis() as u64,
                "in-flight sync did not finish before stop deadline"
            );
        }
        self.inner.set_status(CoordinatorState::Stopped);
        info!("sync coordinator stopped");
    }

    /// Import the file into the store. In bidirectional mode the file is
    /// rewritten afterwards when the merge produced values it does not show.
    pub async fn sync_file_to_app(&self) -> Result<SyncReport, SyncError> {
        self.inner.ensure_running()?;
        let _guard = self.inner.sync_lock.lock().await;
        self.inner.ensure_running()?;
        self.inner.file_cycle().await
    }

    /// Write the store's tasks to the file.
    ///
    /// In bidirectional mode, file edits not yet imported are merged first
    /// so they are never overwritten.
    pub async fn sync_app_to_file(&self) -> Result<SyncReport, SyncError> {
        self.inner.ensure_running()?;
        let _guard = self.inner.sync_lock.lock().await;
        self.inner.ensure_running()?;
        self.inner.catch_up_file().await?;
        self.inner.run(SyncDirection::AppToFile).await
    }

    /// Run the configured direction(s) once: file first, then app.
    pub async fn sync(&self) -> Result<Vec<SyncReport>, SyncError> {
        self.inner.ensure_running()?;
        let _guard = self.inner.sync_lock.lock().await;
        self.inner.ensure_running()?;
        let mut reports = Vec::with_capacity(2);
        let direction = self.inner.config.direction;
        if direction.includes_file_to_app() {
            reports.push(self.inner.run(SyncDirection::FileToApp).await?);
        }
        if direction.includes_app_to_file() {
            reports.push(self.inner.run(SyncDirection::AppToFile).await?);
        }
        Ok(reports)
    }

    /// What [`SyncCoordinator::sync_app_to_file`] would write, as a unified
    /// diff. Writes nothing.
    pub async fn preview_app_to_file(&self) -> Result<Preview, SyncError> {
        let rendering = self.inner.render_file().await?;
        let path = self.inner.config.todo_path.clone();
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let unified_diff = unified_diff(
            &label,
            rendering.existing.as_deref().unwrap_or_default(),
            &rendering.content,
        );
        Ok(Preview {
            path,
            tasks: rendering.tasks.len(),
            unified_diff,
        })
    }

    /// Settle a pending manual conflict in favor of `side`. Returns the
    /// conflict with its resolution filled in.
    pub async fn resolve_conflict(&self, task_id: &TaskId, side: Side) -> Result<Conflict, SyncError> {
        self.inner.ensure_running()?;
        let _guard = self.inner.sync_lock.lock().await;
        self.inner.ensure_running()?;
        self.inner.catch_up_file().await?;
        self.inner.resolve(task_id, side).await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.status.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<CoordinatorState> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> SyncStatistics {
        self.inner.recorder.lock().stats()
    }

    pub fn reset_stats(&self) {
        self.inner.recorder.lock().reset_stats();
    }

    /// Up to `limit` history entries, newest first.
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.inner.recorder.lock().history(limit)
    }

    /// Conflicts waiting for [`SyncCoordinator::resolve_conflict`].
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.inner.state.conflicts().into_values().collect()
    }

    pub fn base_version(&self, task_id: &TaskId) -> Option<BaseVersion> {
        self.inner.state.get_base_version(task_id)
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.state.sync_state()
    }

    pub fn breaker_states(&self) -> BreakerStates {
        let b = &self.inner.breakers;
        BreakerStates {
            file_read: b.file_read.state(),
            file_write: b.file_write.state(),
            db_read: b.db_read.state(),
            db_write: b.db_write.state(),
        }
    }

    fn spawn_event_loop(&self) -> Result<Option<Running>, SyncError> {
        let Some(watcher) = &self.inner.watcher else {
            return Ok(None);
        };
        if !self.inner.config.direction.includes_file_to_app() {
            debug!("app_to_file only; file changes are not watched");
            return Ok(None);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let watch = watcher.watch(&self.inner.config.todo_path, tx)?;
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&self.inner).event_loop(rx, shutdown_rx));
        Ok(Some(Running {
            watch,
            shutdown,
            handle,
        }))
    }
}

fn handle_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "event loop task failed");
    }
}

// ---------------------------------------------------------------------------
// Lifecycle and bookkeeping
// ---------------------------------------------------------------------------

impl Inner {
    fn ensure_running(&self) -> Result<(), SyncError> {
        let state = self.status.borrow().clone();
        if state.is_running() {
            Ok(())
        } else {
            Err(SyncError::InvalidState {
                expected: "started",
                actual: state.to_string(),
            })
        }
    }

    fn set_status(&self, state: CoordinatorState) {
        self.status.send_replace(state);
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    async fn prepare(&self) -> Result<(), SyncError> {
        self.config.validate()?;
        self.state.load().await?;
        if self.state.sync_state().pending {
            warn!("previous sync did not finish; next file sync runs in full");
            self.force_full.store(true, Ordering::SeqCst);
        }
        self.state
            .cleanup_old_base_versions(self.config.base_version_retention_days, Utc::now())
            .await?;
        Ok(())
    }

    /// Leave `Syncing` for `next`, unless something else (such as `stop`)
    /// already moved the state on.
    fn leave_syncing(&self, next: CoordinatorState) {
        self.status.send_if_modified(|s| {
            if *s == CoordinatorState::Syncing {
                *s = next;
                true
            } else {
                false
            }
        });
    }

    fn enter_error(&self, message: String) {
        let since = Utc::now();
        let entered = self.status.send_if_modified(|s| {
            if *s == CoordinatorState::Syncing {
                *s = CoordinatorState::Error { since, message };
                true
            } else {
                false
            }
        });
        if entered {
            self.arm_cooldown(since, self.config.error_cooldown());
        }
    }

    /// Return to the state a skipped cycle interrupted. An `Error` whose
    /// cooldown timer fired mid-cycle gets a fresh timer for what is left.
    fn restore(&self, previous: CoordinatorState) {
        let since = match previous {
            CoordinatorState::Error { since, .. } => since,
            _ => {
                self.leave_syncing(previous);
                return;
            }
        };
        let cooldown = self.config.error_cooldown();
        let elapsed = (Utc::now() - since).to_std().unwrap_or_default();
        if elapsed >= cooldown {
            self.leave_syncing(CoordinatorState::Idle);
        } else {
            self.leave_syncing(previous);
            self.arm_cooldown(since, cooldown - elapsed);
        }
    }

    /// Move `Error { since }` to `Idle` after `delay`, unless the state has
    /// changed in the meantime.
    fn arm_cooldown(&self, since: DateTime<Utc>, delay: std::time::Duration) {
        let status = Arc::clone(&self.status);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let recovered = status.send_if_modified(|s| {
                let expired = matches!(s, CoordinatorState::Error { since: at, .. } if *at == since);
                if expired {
                    *s = CoordinatorState::Idle;
                }
                expired
            });
            if recovered {
                info!("error cooldown elapsed; coordinator idle");
            }
        });
    }

    /// Run `op` through the retry policy and `breaker`.
    async fn guarded<T, F, Fut>(&self, breaker: &CircuitBreaker, operation: &str, op: F) -> Result<T, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let op = &op;
        let outcome = self
            .retry
            .execute(operation, move |_| breaker.call(move || op()))
            .await?;
        Ok(outcome.value)
    }

    fn check_task_limit(&self, count: usize, side: &str) -> Result<(), SyncError> {
        if count > self.config.max_tasks {
            return Err(SyncError::Validation(format!(
                "{side} holds {count} tasks; limit is {}",
                self.config.max_tasks
            )));
        }
        Ok(())
    }

    /// One timed, recorded cycle in `direction` (`FileToApp` or `AppToFile`).
    async fn run(&self, direction: SyncDirection) -> Result<SyncReport, SyncError> {
        let sync_id = Uuid::now_v7();
        let started = Instant::now();
        let retries_before = self.retry.total_retries();
        let previous = self.status.send_replace(CoordinatorState::Syncing);
        self.emit(SyncEvent::SyncStarted { sync_id, direction });

        let span = tracing::info_span!("sync", %sync_id, %direction);
        let result = match direction {
            SyncDirection::AppToFile => self.app_to_file().instrument(span).await,
            _ => self.file_to_app().instrument(span).await,
        };

        let retries = self.retry.total_retries().saturating_sub(retries_before) as u32;
        let duration_ms = started.elapsed().as_millis() as u64;
        let finished_at = Utc::now();

        match result {
            Ok(work) => {
                let report = SyncReport {
                    sync_id,
                    direction,
                    outcome: if work.changed {
                        SyncOutcome::Success
                    } else {
                        SyncOutcome::NoChange
                    },
                    tasks_written: work.tasks_written,
                    tasks_deleted: work.tasks_deleted,
                    conflicts: work.conflicts,
                    pending_conflicts: self.state.conflicts().len(),
                    retries,
                    duration_ms,
                    finished_at,
                    backup: work.backup,
                    file_outdated: work.file_outdated,
                };
                self.recorder.lock().record(HistoryEntry {
                    sync_id,
                    direction,
                    outcome: report.outcome,
                    duration_ms,
                    timestamp: finished_at,
                    tasks_written: report.tasks_written,
                    conflicts: report.conflicts.len(),
                    retries,
                    error: None,
                });
                self.leave_syncing(CoordinatorState::Idle);
                info!(
                    %sync_id,
                    %direction,
                    outcome = %report.outcome,
                    written = report.tasks_written,
                    deleted = report.tasks_deleted,
                    conflicts = report.conflicts.len(),
                    retries,
                    duration_ms,
                    "sync completed"
                );
                self.emit(SyncEvent::SyncCompleted(report.clone()));
                Ok(report)
            }
            Err(err) => {
                if let Err(e) = self.state.set_pending(false).await {
                    debug!(error = %e, "could not clear pending flag");
                }
                self.recorder.lock().record(HistoryEntry {
                    sync_id,
                    direction,
                    outcome: SyncOutcome::Failed,
                    duration_ms,
                    timestamp: finished_at,
                    tasks_written: 0,
                    conflicts: 0,
                    retries,
                    error: Some(err.to_string()),
                });
                if err.is_surfaced() {
                    error!(%sync_id, %direction, kind = err.kind(), retries, error = %err, "sync failed");
                    self.emit(SyncEvent::SyncError {
                        sync_id,
                        direction,
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    });
                    self.enter_error(err.to_string());
                } else {
                    warn!(%sync_id, %direction, kind = err.kind(), error = %err, "sync cycle skipped");
                    self.restore(previous);
                }
                Err(err)
            }
        }
    }

    /// File → app, then a file refresh when bidirectional and needed.
    async fn file_cycle(&self) -> Result<SyncReport, SyncError> {
        let report = self.run(SyncDirection::FileToApp).await?;
        if report.file_outdated && self.config.direction == SyncDirection::Bidirectional {
            debug!(sync_id = %report.sync_id, "refreshing file with merged values");
            self.run(SyncDirection::AppToFile).await?;
        }
        Ok(report)
    }

    /// Import file edits made since the last sync before touching the file.
    async fn catch_up_file(&self) -> Result<(), SyncError> {
        if self.config.direction != SyncDirection::Bidirectional {
            return Ok(());
        }
        let path = self.config.todo_path.as_path();
        let reads = &self.breakers.file_read;
        if !self.guarded(reads, "exists", || self.fs.exists(path)).await? {
            return Ok(());
        }
        let content = self
            .guarded(reads, "read_file", || self.fs.read_file(path))
            .await?;
        let digest = content_digest(&content);
        if self.state.sync_state().last_file_hash.as_deref() == Some(digest.as_str()) {
            return Ok(());
        }
        info!("file changed since the last sync; importing it first");
        self.file_cycle().await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// File → app
// ---------------------------------------------------------------------------

impl Inner {
    async fn file_to_app(&self) -> Result<CycleWork, SyncError> {
        let path = self.config.todo_path.as_path();
        let reads = &self.breakers.file_read;
        if !self.guarded(reads, "exists", || self.fs.exists(path)).await? {
            warn!(path = %path.display(), "todo file missing; nothing to import");
            return Ok(CycleWork::default());
        }
        let stat = self.guarded(reads, "stat", || self.fs.stat(path)).await?;
        let limit = self.config.max_file_size_bytes();
        if stat.size > limit {
            return Err(SyncError::Validation(format!(
                "{} is {} bytes; limit is {limit}",
                path.display(),
                stat.size
            )));
        }
        let content = self
            .guarded(reads, "read_file", || self.fs.read_file(path))
            .await?;
        let digest = content_digest(&content);
        let forced = self.force_full.load(Ordering::SeqCst);
        if !forced && self.state.sync_state().last_file_hash.as_deref() == Some(digest.as_str()) {
            debug!("file unchanged since last sync");
            return Ok(CycleWork::default());
        }

        let now = Utc::now();
        let mut file_tasks = parse_tasks(&content, now)?;
        self.check_task_limit(file_tasks.len(), "file")?;
        let bases = self.state.base_versions();
        stamp_file_edits(&self.diff, &mut file_tasks, &bases, stat.modified);

        self.state.set_pending(true).await?;
        let app_tasks = self
            .guarded(&self.breakers.db_read, "get_all", || self.db.get_all())
            .await?;
        self.check_task_limit(app_tasks.len(), "store")?;

        let diff = self.diff.detect(&app_tasks, &file_tasks);
        debug!(
            added = diff.added.len(),
            updated = diff.updated.len(),
            removed = diff.removed.len(),
            "file compared with store"
        );
        let changed_ids = diff.ids();
        let file_map = by_id(file_tasks);
        let app_map = by_id(app_tasks);
        let previous_conflicts = self.state.conflicts();

        let mut work = CycleWork::default();
        let mut mutations = Vec::new();
        let mut upserts = Vec::new();
        let mut removals = Vec::new();
        let mut pending = BTreeMap::new();
        let mut detected = Vec::new();

        for id in &changed_ids {
            let base = TaskVersion::from(bases.get(id).map(|b| b.snapshot.clone()));
            let file = TaskVersion::from(file_map.get(id).cloned());
            let app = TaskVersion::from(app_map.get(id).cloned());
            let outcome = match self.config.strategy {
                SyncStrategy::ThreeWayMerge => self.merger.merge(id, &base, &file, &app, now),
                SyncStrategy::LastWriteWins => last_write_wins(&base, &file, &app),
            };
            let resolved = match outcome {
                MergeOutcome::Merged(task) => ResolutionOutcome::Write(task),
                MergeOutcome::Deleted => ResolutionOutcome::Delete,
                MergeOutcome::Conflict(mut conflict) => {
                    let resolved = self.resolver.resolve(&mut conflict);
                    let known = previous_conflicts
                        .get(id)
                        .filter(|p| p.file == conflict.file && p.app == conflict.app);
                    match known {
                        Some(previous) => conflict.detected_at = previous.detected_at,
                        None => {
                            info!(
                                task_id = %id,
                                fields = %conflict.describe(),
                                resolution = ?conflict.resolution,
                                "conflict detected"
                            );
                            detected.push(conflict.clone());
                        }
                    }
                    if resolved == ResolutionOutcome::Pending {
                        pending.insert(id.clone(), conflict);
                    }
                    resolved
                }
            };

            match resolved {
                ResolutionOutcome::Pending => {}
                ResolutionOutcome::Write(task) => {
                    match file.as_task() {
                        Some(f) if self.diff.same_content(f, &task) => {
                            upserts.push(BaseVersion::new(task.clone(), self.diff.hash(&task), now));
                        }
                        _ => work.file_outdated = true,
                    }
                    if app.as_task() != Some(&task) {
                        debug!(task_id = %id, "task queued for store");
                        mutations.push(TaskMutation::Upsert(task));
                        work.tasks_written += 1;
                    }
                }
                ResolutionOutcome::Delete => {
                    if app.is_present() {
                        debug!(task_id = %id, "task deletion queued for store");
                        mutations.push(TaskMutation::Delete(id.clone()));
                        work.tasks_deleted += 1;
                    }
                    if file.is_present() {
                        work.file_outdated = true;
                    } else {
                        removals.push(id.clone());
                    }
                }
            }
        }

        // Identical on both sides: only the base may need refreshing.
        let changed: HashSet<&TaskId> = changed_ids.iter().collect();
        for (id, task) in &app_map {
            if changed.contains(id) || !file_map.contains_key(id) {
                continue;
            }
            let hash = self.diff.hash(task);
            if bases.get(id).map(|b| b.content_hash.as_str()) != Some(hash.as_str()) {
                upserts.push(BaseVersion::new(task.clone(), hash, now));
            }
        }
        removals.extend(
            bases
                .keys()
                .filter(|id| !file_map.contains_key(*id) && !app_map.contains_key(*id))
                .cloned(),
        );

        if !mutations.is_empty() {
            let report = self
                .guarded(&self.breakers.db_write, "batch_commit", || {
                    self.batch.commit(mutations.clone())
                })
                .await?;
            debug!(applied = report.applied(), "store updated");
        }
        self.state
            .commit_sync(upserts, removals, Some(digest), now)
            .await?;
        self.state.replace_conflicts(pending).await?;
        self.force_full.store(false, Ordering::SeqCst);

        for conflict in &detected {
            self.emit(SyncEvent::ConflictDetected(conflict.clone()));
        }
        work.changed = !mutations.is_empty() || !detected.is_empty();
        work.conflicts = detected;
        Ok(work)
    }
}

fn by_id(tasks: Vec<Task>) -> BTreeMap<TaskId, Task> {
    tasks.into_iter().map(|t| (t.id.clone(), t)).collect()
}

/// File edits that kept the old `updated` stamp take the file's mtime, so
/// timestamp comparisons see them as the recent change they are.
fn stamp_file_edits(
    diff: &DiffDetector,
    tasks: &mut [Task],
    bases: &BTreeMap<TaskId, BaseVersion>,
    modified: DateTime<Utc>,
) {
    for task in tasks {
        let Some(base) = bases.get(&task.id) else {
            continue;
        };
        if task.updated_at <= base.snapshot.updated_at && !diff.same_content(task, &base.snapshot) {
            task.updated_at = modified.max(base.snapshot.updated_at);
        }
    }
}

// ---------------------------------------------------------------------------
// App → file
// ---------------------------------------------------------------------------

impl Inner {
    async fn render_file(&self) -> Result<Rendering, SyncError> {
        let path = self.config.todo_path.as_path();
        let reads = &self.breakers.file_read;
        let app_tasks = self
            .guarded(&self.breakers.db_read, "get_all", || self.db.get_all())
            .await?;
        let existing = if self.guarded(reads, "exists", || self.fs.exists(path)).await? {
            Some(
                self.guarded(reads, "read_file", || self.fs.read_file(path))
                    .await?,
            )
        } else {
            None
        };
        // A file that no longer parses is being edited; never overwrite it.
        let file_tasks = match &existing {
            Some(content) => parse_tasks(content, Utc::now())?,
            None => Vec::new(),
        };
        let pending = self.state.conflicts();
        let previous = by_id(file_tasks.clone());
        let tasks = order_for_file(file_tasks, app_tasks, &pending);
        self.check_task_limit(tasks.len(), "file")?;
        for task in &tasks {
            check_serializable(task).map_err(SyncError::Validation)?;
        }
        let content = serialize_tasks(&tasks);
        Ok(Rendering {
            tasks,
            content,
            existing,
            previous,
            pending,
        })
    }

    async fn app_to_file(&self) -> Result<CycleWork, SyncError> {
        let path = self.config.todo_path.as_path();
        let Rendering {
            tasks,
            content,
            existing,
            previous,
            pending,
        } = self.render_file().await?;
        let digest = content_digest(&content);
        let now = Utc::now();
        let mut work = CycleWork::default();

        let unchanged = existing.as_deref().map(content_digest).as_deref() == Some(digest.as_str());
        if unchanged {
            debug!("file already matches store");
        } else {
            self.state.set_pending(true).await?;
            let writes = &self.breakers.file_write;
            if self.config.auto_backup && existing.is_some() {
                work.backup = self
                    .guarded(writes, "backup", || create_backup(self.fs.as_ref(), path, now))
                    .await?;
                if let Err(err) = prune_backups(self.fs.as_ref(), path, self.config.max_backups).await {
                    warn!(error = %err, "could not prune old backups");
                }
            }
            self.guarded(writes, "write_file", || self.fs.write_file(path, &content))
                .await?;
            work.changed = true;
            work.tasks_written = tasks
                .iter()
                .filter(|t| {
                    previous
                        .get(&t.id)
                        .map_or(true, |p| !self.diff.same_content(p, t))
                })
                .count();
            let kept: HashSet<&TaskId> = tasks.iter().map(|t| &t.id).collect();
            work.tasks_deleted = previous.keys().filter(|id| !kept.contains(id)).count();
            info!(path = %path.display(), tasks = tasks.len(), "todo file written");
        }

        let bases = self.state.base_versions();
        let upserts: Vec<BaseVersion> = tasks
            .iter()
            .filter(|t| !pending.contains_key(&t.id))
            .filter_map(|t| {
                let hash = self.diff.hash(t);
                let stale = bases.get(&t.id).map_or(true, |b| b.content_hash != hash);
                stale.then(|| BaseVersion::new(t.clone(), hash, now))
            })
            .collect();
        let written: HashSet<&TaskId> = tasks.iter().map(|t| &t.id).collect();
        let removals: Vec<TaskId> = bases
            .keys()
            .filter(|id| !written.contains(id) && !pending.contains_key(*id))
            .cloned()
            .collect();
        self.state
            .commit_sync(upserts, removals, Some(digest), now)
            .await?;
        Ok(work)
    }
}

/// Store tasks in file order. Tasks already in the file keep their place
/// and new ones follow by creation time. A task with a pending conflict
/// keeps its file version, or stays out if the file never had it.
fn order_for_file(
    file_tasks: Vec<Task>,
    app_tasks: Vec<Task>,
    pending: &BTreeMap<TaskId, Conflict>,
) -> Vec<Task> {
    let mut app = by_id(app_tasks);
    let mut ordered = Vec::with_capacity(app.len());
    for task in file_tasks {
        if pending.contains_key(&task.id) {
            app.remove(&task.id);
            ordered.push(task);
        } else if let Some(current) = app.remove(&task.id) {
            ordered.push(current);
        }
    }
    let mut rest: Vec<Task> = app
        .into_values()
        .filter(|t| !pending.contains_key(&t.id))
        .collect();
    rest.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    ordered.extend(rest);
    ordered
}

// ---------------------------------------------------------------------------
// Manual resolution
// ---------------------------------------------------------------------------

impl Inner {
    async fn resolve(&self, task_id: &TaskId, side: Side) -> Result<Conflict, SyncError> {
        let mut pending = self.state.conflicts();
        let Some(mut conflict) = pending.remove(task_id) else {
            return Err(SyncError::UnknownConflict {
                task_id: task_id.clone(),
            });
        };
        let outcome = take_side(&conflict, side);
        let current = self
            .guarded(&self.breakers.db_read, "get", || self.db.get(task_id))
            .await?;
        let mutation = match &outcome {
            ResolutionOutcome::Pending => {
                return Err(SyncError::Validation(format!(
                    "conflict on {task_id} cannot be settled from the {side} side"
                )))
            }
            ResolutionOutcome::Write(task) if current.as_ref() != Some(task) => {
                Some(TaskMutation::Upsert(task.clone()))
            }
            ResolutionOutcome::Delete if current.is_some() => Some(TaskMutation::Delete(task_id.clone())),
            _ => None,
        };
        if let Some(mutation) = mutation {
            let batch = vec![mutation];
            self.guarded(&self.breakers.db_write, "batch_commit", || {
                self.batch.commit(batch.clone())
            })
            .await?;
        }
        conflict.resolution = Resolution::Resolved { chosen: side };
        self.state.replace_conflicts(pending).await?;
        info!(task_id = %task_id, %side, "conflict resolved");

        if self.config.direction.includes_app_to_file() {
            self.run(SyncDirection::AppToFile).await?;
        } else {
            match (&outcome, conflict.file.as_task()) {
                (ResolutionOutcome::Write(task), Some(file)) if self.diff.same_content(task, file) => {
                    let version = BaseVersion::new(task.clone(), self.diff.hash(task), Utc::now());
                    self.state.set_base_version(version).await?;
                }
                (ResolutionOutcome::Delete, None) => self.state.remove_base_version(task_id).await?,
                _ => {}
            }
        }
        Ok(conflict)
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

impl Inner {
    /// Debounce file events, respect the throttle, and run file syncs until
    /// shutdown. Events that arrive during a sync collapse into a single
    /// follow-up pass.
    async fn event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<FileEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let debounce = self.config.debounce();
        let throttle = self.config.throttle();
        let mut status = self.status.subscribe();
        let mut last_run: Option<Instant> = None;
        let mut queued = false;

        loop {
            if !queued {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = events.recv() => match event {
                        Some(event) => debug!(path = %event.path.display(), "file change"),
                        None => break,
                    },
                }
            }
            queued = false;

            // Each new event restarts the quiet period.
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    event = events.recv() => match event {
                        Some(_) => continue,
                        None => return,
                    },
                    _ = tokio::time::sleep(debounce) => break,
                }
            }

            if let Some(last) = last_run {
                let ready = last + throttle;
                if Instant::now() < ready {
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        _ = tokio::time::sleep_until(ready) => {}
                    }
                }
            }

            if matches!(*status.borrow(), CoordinatorState::Error { .. }) {
                debug!("waiting out error cooldown");
                tokio::select! {
                    _ = shutdown.recv() => return,
                    changed = status.wait_for(|s| !matches!(s, CoordinatorState::Error { .. })) => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            while events.try_recv().is_ok() {}

            {
                let _guard = self.sync_lock.lock().await;
                if !self.status.borrow().is_running() {
                    return;
                }
                last_run = Some(Instant::now());
                if let Err(err) = self.file_cycle().await {
                    debug!(error = %err, "file-triggered sync did not complete");
                }
            }

            if events.try_recv().is_ok() {
                while events.try_recv().is_ok() {}
                queued = true;
            }
        }
        debug!("event loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-19T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(minutes)
    }

    #[test]
    fn file_order_is_kept_and_new_tasks_follow_by_creation() {
        let file = vec![Task::new("b", "B", at(0)), Task::new("a", "A", at(0))];
        let app = vec![
            Task::new("a", "A2", at(0)),
            Task::new("b", "B", at(0)),
            Task::new("d", "D", at(2)),
            Task::new("c", "C", at(1)),
        ];
        let ids: Vec<String> = order_for_file(file, app, &BTreeMap::new())
            .into_iter()
            .map(|t| t.id.0)
            .collect();
        assert_eq!(ids, ["b", "a", "c", "d"]);
    }

    #[test]
    fn pending_conflicts_keep_the_file_version() {
        let file = vec![Task::new("a", "file title", at(0))];
        let app = vec![Task::new("a", "app title", at(0)), Task::new("x", "only app", at(0))];
        let conflict = |id: &str| Conflict {
            task_id: TaskId::from(id),
            kind: crate::merge::ConflictKind::Fields,
            base: TaskVersion::Absent,
            file: TaskVersion::Absent,
            app: TaskVersion::Absent,
            fields: Vec::new(),
            merged: None,
            resolution: Resolution::Pending,
            detected_at: at(0),
        };
        let pending: BTreeMap<TaskId, Conflict> = [("a", conflict("a")), ("x", conflict("x"))]
            .into_iter()
            .map(|(id, c)| (TaskId::from(id), c))
            .collect();

        let tasks = order_for_file(file, app, &pending);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "file title");
    }

    #[test]
    fn unstamped_file_edits_take_the_mtime() {
        let detector = DiffDetector::new(false);
        let base = Task::new("a", "Old", at(0));
        let bases = BTreeMap::from([(
            TaskId::from("a"),
            BaseVersion::new(base.clone(), detector.hash(&base), at(0)),
        )]);
        let mut edited = base.clone();
        edited.title = "New".into();
        let untouched = Task::new("b", "Same", at(0));
        let mut tasks = vec![edited, untouched];

        stamp_file_edits(&detector, &mut tasks, &bases, at(30));
        assert_eq!(tasks[0].updated_at, at(30));
        assert_eq!(tasks[1].updated_at, at(0));
    }
}
