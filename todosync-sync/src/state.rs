//! Sync state: base versions plus last-sync metadata.
//!
//! The persisted snapshot is always written first; the in-memory view is
//! swapped only after the backend accepted it, so a failed save never leaves
//! a half-updated set of base versions behind.
//!
//! ```text
//! ~/.todosync/
//!   state.json    (written via state.json.tmp + rename)
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use todosync_core::{Task, TaskId};

use crate::error::{io_err, SyncError};
use crate::merge::Conflict;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Last agreed state of a task, present in both the file and the store at
/// the time it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseVersion {
    pub task_id: TaskId,
    pub snapshot: Task,
    pub content_hash: String,
    pub timestamp: DateTime<Utc>,
}

impl BaseVersion {
    pub fn new(snapshot: Task, content_hash: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            task_id: snapshot.id.clone(),
            snapshot,
            content_hash,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_file_hash: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Set while a cycle is writing; still set on load means the previous
    /// process stopped mid-sync.
    #[serde(default)]
    pub pending: bool,
}

/// Everything a [`StateBackend`] persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub sync: SyncState,
    #[serde(default)]
    pub base_versions: BTreeMap<TaskId, BaseVersion>,
    /// Conflicts waiting for a manual resolution.
    #[serde(default)]
    pub conflicts: BTreeMap<TaskId, Conflict>,
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn load(&self) -> Result<StateSnapshot, SyncError>;
    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), SyncError>;
}

/// `<home>/.todosync/state.json`. Pure, no I/O.
pub fn state_path_at(home: &Path) -> PathBuf {
    home.join(".todosync").join("state.json")
}

/// JSON file backend. Blocking I/O runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct JsonStateBackend {
    path: PathBuf,
}

impl JsonStateBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn at_home(home: &Path) -> Self {
        Self::new(state_path_at(home))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn load_blocking(path: &Path) -> Result<StateSnapshot, SyncError> {
    if !path.exists() {
        return Ok(StateSnapshot::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err("read_state", path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

fn save_blocking(path: &Path, snapshot: &StateSnapshot) -> Result<(), SyncError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err("create_dir", dir, e))?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err("write_state", &tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err("write_state", path, e))?;
    Ok(())
}

#[async_trait]
impl StateBackend for JsonStateBackend {
    async fn load(&self) -> Result<StateSnapshot, SyncError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_blocking(&path))
            .await
            .map_err(|e| SyncError::Join(e.to_string()))?
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), SyncError> {
        let path = self.path.clone();
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || save_blocking(&path, &snapshot))
            .await
            .map_err(|e| SyncError::Join(e.to_string()))?
    }
}

/// In-memory backend with an injectable save failure.
#[derive(Debug, Default)]
pub struct MemoryStateBackend {
    stored: Mutex<StateSnapshot>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            stored: Mutex::new(snapshot),
            ..Self::default()
        }
    }

    pub fn stored(&self) -> StateSnapshot {
        self.stored.lock().clone()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn load(&self) -> Result<StateSnapshot, SyncError> {
        Ok(self.stored())
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), SyncError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(io_err(
                "write_state",
                "memory://state",
                std::io::ErrorKind::PermissionDenied.into(),
            ));
        }
        *self.stored.lock() = snapshot.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the base versions and last-sync metadata for one coordinator.
///
/// Reads take a short shared lock on the in-memory view. Writes are
/// serialized among themselves but never hold the read lock while the
/// backend is saving.
pub struct SyncStateManager {
    backend: std::sync::Arc<dyn StateBackend>,
    current: RwLock<StateSnapshot>,
    writer: tokio::sync::Mutex<()>,
}

impl SyncStateManager {
    /// An empty manager; call [`SyncStateManager::load`] before use.
    pub fn new(backend: std::sync::Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            current: RwLock::new(StateSnapshot::default()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the in-memory view with the backend's snapshot.
    pub async fn load(&self) -> Result<(), SyncError> {
        let _guard = self.writer.lock().await;
        let snapshot = self.backend.load().await.map_err(unavailable)?;
        *self.current.write() = snapshot;
        Ok(())
    }

    pub fn get_base_version(&self, task_id: &TaskId) -> Option<BaseVersion> {
        self.current.read().base_versions.get(task_id).cloned()
    }

    pub fn base_versions(&self) -> BTreeMap<TaskId, BaseVersion> {
        self.current.read().base_versions.clone()
    }

    pub fn sync_state(&self) -> SyncState {
        self.current.read().sync.clone()
    }

    pub fn conflicts(&self) -> BTreeMap<TaskId, Conflict> {
        self.current.read().conflicts.clone()
    }

    /// Persist the set of pending conflicts. Skips the write when nothing
    /// changed.
    pub async fn replace_conflicts(&self, conflicts: BTreeMap<TaskId, Conflict>) -> Result<(), SyncError> {
        if self.current.read().conflicts == conflicts {
            return Ok(());
        }
        self.mutate(move |snapshot| snapshot.conflicts = conflicts).await
    }

    pub async fn set_base_version(&self, version: BaseVersion) -> Result<(), SyncError> {
        self.commit_base_versions(vec![version], Vec::new()).await
    }

    pub async fn remove_base_version(&self, task_id: &TaskId) -> Result<(), SyncError> {
        self.commit_base_versions(Vec::new(), vec![task_id.clone()])
            .await
    }

    /// Apply upserts and removals as one persisted write.
    pub async fn commit_base_versions(
        &self,
        upserts: Vec<BaseVersion>,
        removals: Vec<TaskId>,
    ) -> Result<(), SyncError> {
        self.mutate(|snapshot| {
            apply_base_changes(snapshot, upserts, removals);
        })
        .await
    }

    /// Record the outcome of a successful cycle in one persisted write:
    /// base version changes, the file hash (if known) and the sync time.
    /// Clears the pending flag.
    pub async fn commit_sync(
        &self,
        upserts: Vec<BaseVersion>,
        removals: Vec<TaskId>,
        file_hash: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.mutate(|snapshot| {
            apply_base_changes(snapshot, upserts, removals);
            if let Some(hash) = file_hash {
                snapshot.sync.last_file_hash = Some(hash);
            }
            snapshot.sync.last_synced_at = Some(at);
            snapshot.sync.pending = false;
        })
        .await
    }

    pub async fn record_file_sync(&self, hash: String, at: DateTime<Utc>) -> Result<(), SyncError> {
        self.commit_sync(Vec::new(), Vec::new(), Some(hash), at)
            .await
    }

    pub async fn set_pending(&self, pending: bool) -> Result<(), SyncError> {
        if self.current.read().sync.pending == pending {
            return Ok(());
        }
        self.mutate(|snapshot| snapshot.sync.pending = pending).await
    }

    /// Drop base versions recorded more than `older_than_days` before `now`.
    /// Returns how many were removed.
    pub async fn cleanup_old_base_versions(
        &self,
        older_than_days: u32,
        now: DateTime<Utc>,
    ) -> Result<usize, SyncError> {
        let cutoff = now - Duration::days(i64::from(older_than_days));
        let stale: Vec<TaskId> = self
            .current
            .read()
            .base_versions
            .values()
            .filter(|v| v.timestamp < cutoff)
            .map(|v| v.task_id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let removed = stale.len();
        self.commit_base_versions(Vec::new(), stale).await?;
        tracing::info!(removed, older_than_days, "pruned stale base versions");
        Ok(removed)
    }

    async fn mutate(&self, change: impl FnOnce(&mut StateSnapshot) + Send) -> Result<(), SyncError> {
        let _guard = self.writer.lock().await;
        let mut next = self.current.read().clone();
        change(&mut next);
        self.backend.save(&next).await.map_err(unavailable)?;
        *self.current.write() = next;
        Ok(())
    }
}

fn apply_base_changes(snapshot: &mut StateSnapshot, upserts: Vec<BaseVersion>, removals: Vec<TaskId>) {
    for id in removals {
        snapshot.base_versions.remove(&id);
    }
    for version in upserts {
        snapshot
            .base_versions
            .insert(version.task_id.clone(), version);
    }
}

fn unavailable(err: SyncError) -> SyncError {
    match err {
        SyncError::StateUnavailable(_) => err,
        other => SyncError::StateUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn version(id: &str, at: DateTime<Utc>) -> BaseVersion {
        BaseVersion::new(Task::new(id, "Title", at), format!("hash-{id}"), at)
    }

    #[tokio::test]
    async fn failed_save_keeps_previous_view() {
        let backend = Arc::new(MemoryStateBackend::new());
        let manager = SyncStateManager::new(backend.clone());
        manager
            .set_base_version(version("a", Utc::now()))
            .await
            .unwrap();

        backend.fail_saves(true);
        let err = manager
            .set_base_version(version("b", Utc::now()))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::StateUnavailable(_)));
        assert!(manager.get_base_version(&TaskId::from("a")).is_some());
        assert!(manager.get_base_version(&TaskId::from("b")).is_none());
        assert_eq!(backend.stored().base_versions.len(), 1);
    }

    #[tokio::test]
    async fn commit_sync_records_hash_and_clears_pending() {
        let backend = Arc::new(MemoryStateBackend::new());
        let manager = SyncStateManager::new(backend.clone());
        manager.set_pending(true).await.unwrap();
        assert!(manager.sync_state().pending);

        let now = Utc::now();
        manager
            .commit_sync(vec![version("a", now)], Vec::new(), Some("abc".into()), now)
            .await
            .unwrap();

        let state = manager.sync_state();
        assert_eq!(state.last_file_hash.as_deref(), Some("abc"));
        assert_eq!(state.last_synced_at, Some(now));
        assert!(!state.pending);
        assert_eq!(backend.save_count(), 2);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_versions() {
        let manager = SyncStateManager::new(Arc::new(MemoryStateBackend::new()));
        let now = Utc::now();
        manager
            .commit_base_versions(
                vec![version("old", now - Duration::days(45)), version("new", now)],
                Vec::new(),
            )
            .await
            .unwrap();

        assert_eq!(manager.cleanup_old_base_versions(30, now).await.unwrap(), 1);
        assert!(manager.get_base_version(&TaskId::from("old")).is_none());
        assert!(manager.get_base_version(&TaskId::from("new")).is_some());
        assert_eq!(manager.cleanup_old_base_versions(30, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn json_backend_roundtrip_and_missing_file() {
        let home = TempDir::new().unwrap();
        let backend = JsonStateBackend::at_home(home.path());
        assert_eq!(backend.load().await.unwrap(), StateSnapshot::default());

        let manager = SyncStateManager::new(Arc::new(backend.clone()));
        manager
            .commit_sync(vec![version("a", Utc::now())], Vec::new(), Some("h".into()), Utc::now())
            .await
            .unwrap();

        let reloaded = SyncStateManager::new(Arc::new(backend.clone()));
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.base_versions(), manager.base_versions());
        assert!(!backend.path().with_extension("json.tmp").exists());
    }
}
