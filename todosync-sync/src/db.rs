//! App task store capability.
//!
//! Every multi-task change goes through [`Database::transaction`]: the
//! callback runs against a scratch copy of the table and is committed only
//! if it returns `Ok`. A callback error leaves the durable store untouched.

use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use todosync_core::{Task, TaskId};

use crate::error::{io_err, SyncError};
use crate::fs::tmp_path;

/// Mutations visible inside a single transaction.
pub trait TaskTransaction: Send {
    fn get(&self, id: &TaskId) -> Option<Task>;
    fn upsert(&mut self, task: Task) -> Result<(), SyncError>;
    /// Returns `false` if the task did not exist.
    fn delete(&mut self, id: &TaskId) -> Result<bool, SyncError>;
}

/// Transaction body. Returning `Err` rolls the whole transaction back.
pub type TransactionFn =
    Box<dyn FnOnce(&mut dyn TaskTransaction) -> Result<(), SyncError> + Send>;

#[async_trait]
pub trait Database: Send + Sync {
    async fn get(&self, id: &TaskId) -> Result<Option<Task>, SyncError>;
    /// All tasks, ordered by id.
    async fn get_all(&self) -> Result<Vec<Task>, SyncError>;
    /// Fails with [`SyncError::Validation`] if the id is taken.
    async fn create(&self, task: Task) -> Result<(), SyncError>;
    /// Fails with [`SyncError::Validation`] if the id is unknown.
    async fn update(&self, task: Task) -> Result<(), SyncError>;
    async fn delete(&self, id: &TaskId) -> Result<bool, SyncError>;
    async fn transaction(&self, work: TransactionFn) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// Shared table
// ---------------------------------------------------------------------------

type TaskTable = BTreeMap<TaskId, Task>;

struct TableTx<'a> {
    table: &'a mut TaskTable,
    fail_on: &'a HashSet<TaskId>,
    location: &'a Path,
}

impl TaskTransaction for TableTx<'_> {
    fn get(&self, id: &TaskId) -> Option<Task> {
        self.table.get(id).cloned()
    }

    fn upsert(&mut self, task: Task) -> Result<(), SyncError> {
        if self.fail_on.contains(&task.id) {
            return Err(io_err(
                "upsert",
                self.location.join(task.id.as_str()),
                std::io::Error::new(ErrorKind::Other, "injected upsert failure"),
            ));
        }
        self.table.insert(task.id.clone(), task);
        Ok(())
    }

    fn delete(&mut self, id: &TaskId) -> Result<bool, SyncError> {
        Ok(self.table.remove(id).is_some())
    }
}

fn single_write(
    table: &mut TaskTable,
    task: Task,
    must_exist: bool,
) -> Result<(), SyncError> {
    let exists = table.contains_key(&task.id);
    if must_exist && !exists {
        return Err(SyncError::Validation(format!("task {} does not exist", task.id)));
    }
    if !must_exist && exists {
        return Err(SyncError::Validation(format!("task {} already exists", task.id)));
    }
    table.insert(task.id.clone(), task);
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory double
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryFaults {
    transactions: usize,
    kind: Option<ErrorKind>,
    upserts: HashSet<TaskId>,
}

/// In-memory [`Database`] with injectable transaction and per-task failures.
#[derive(Debug)]
pub struct MemoryDatabase {
    tasks: Mutex<TaskTable>,
    faults: Mutex<MemoryFaults>,
    transactions: AtomicUsize,
    commits: AtomicUsize,
    location: PathBuf,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(TaskTable::new()),
            faults: Mutex::new(MemoryFaults::default()),
            transactions: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            location: PathBuf::from("memory://tasks"),
        }
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let db = Self::new();
        db.seed(tasks);
        db
    }

    /// Replace or add tasks directly, bypassing transactions and counters.
    pub fn seed(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut table = self.tasks.lock();
        for task in tasks {
            table.insert(task.id.clone(), task);
        }
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.lock().values().cloned().collect()
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.tasks.lock().get(&TaskId::from(id)).cloned()
    }

    /// Fail the next `count` transactions before the callback runs.
    pub fn fail_transactions(&self, count: usize, kind: ErrorKind) {
        let mut faults = self.faults.lock();
        faults.transactions = count;
        faults.kind = Some(kind);
    }

    /// Fail any upsert of `id` inside a transaction.
    pub fn fail_upsert_of(&self, id: &str) {
        self.faults.lock().upserts.insert(TaskId::from(id));
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = MemoryFaults::default();
    }

    /// Transaction attempts, including failed ones.
    pub fn transaction_count(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    /// Transactions that committed.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get(&self, id: &TaskId) -> Result<Option<Task>, SyncError> {
        Ok(self.tasks.lock().get(id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Task>, SyncError> {
        Ok(self.snapshot())
    }

    async fn create(&self, task: Task) -> Result<(), SyncError> {
        single_write(&mut self.tasks.lock(), task, false)
    }

    async fn update(&self, task: Task) -> Result<(), SyncError> {
        single_write(&mut self.tasks.lock(), task, true)
    }

    async fn delete(&self, id: &TaskId) -> Result<bool, SyncError> {
        Ok(self.tasks.lock().remove(id).is_some())
    }

    async fn transaction(&self, work: TransactionFn) -> Result<(), SyncError> {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        let fail_on = {
            let mut faults = self.faults.lock();
            if faults.transactions > 0 {
                if faults.transactions != usize::MAX {
                    faults.transactions -= 1;
                }
                let kind = faults.kind.unwrap_or(ErrorKind::Other);
                return Err(io_err("transaction", &self.location, kind.into()));
            }
            faults.upserts.clone()
        };

        let mut tasks = self.tasks.lock();
        let mut scratch = tasks.clone();
        work(&mut TableTx {
            table: &mut scratch,
            fail_on: &fail_on,
            location: &self.location,
        })?;
        *tasks = scratch;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// A [`Database`] persisted as a single JSON document.
///
/// The table is cached in memory; every committed change rewrites the file
/// via tmp + rename, so a crash leaves either the old or the new table.
pub struct JsonFileDatabase {
    path: PathBuf,
    tasks: tokio::sync::Mutex<TaskTable>,
}

impl JsonFileDatabase {
    /// Open the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let tasks = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let file: TaskFile = serde_json::from_str(&contents)?;
                file.tasks
                    .into_iter()
                    .map(|t| (t.id.clone(), t))
                    .collect()
            }
            Err(e) if e.kind() == ErrorKind::NotFound => TaskTable::new(),
            Err(e) => return Err(io_err("open", &path, e)),
        };
        Ok(Self {
            path,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, table: &TaskTable) -> Result<(), SyncError> {
        let file = TaskFile {
            tasks: table.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_err("create_dir", dir, e))?;
        }
        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_err("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_err("rename", &self.path, e))
    }

    async fn write_one(&self, task: Task, must_exist: bool) -> Result<(), SyncError> {
        let mut tasks = self.tasks.lock().await;
        let mut scratch = tasks.clone();
        single_write(&mut scratch, task, must_exist)?;
        self.persist(&scratch).await?;
        *tasks = scratch;
        Ok(())
    }
}

#[async_trait]
impl Database for JsonFileDatabase {
    async fn get(&self, id: &TaskId) -> Result<Option<Task>, SyncError> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Task>, SyncError> {
        Ok(self.tasks.lock().await.values().cloned().collect())
    }

    async fn create(&self, task: Task) -> Result<(), SyncError> {
        self.write_one(task, false).await
    }

    async fn update(&self, task: Task) -> Result<(), SyncError> {
        self.write_one(task, true).await
    }

    async fn delete(&self, id: &TaskId) -> Result<bool, SyncError> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.contains_key(id) {
            return Ok(false);
        }
        let mut scratch = tasks.clone();
        scratch.remove(id);
        self.persist(&scratch).await?;
        *tasks = scratch;
        Ok(true)
    }

    async fn transaction(&self, work: TransactionFn) -> Result<(), SyncError> {
        let mut tasks = self.tasks.lock().await;
        let mut scratch = tasks.clone();
        let no_faults = HashSet::new();
        work(&mut TableTx {
            table: &mut scratch,
            fail_on: &no_faults,
            location: &self.path,
        })?;
        if scratch != *tasks {
            self.persist(&scratch).await?;
            *tasks = scratch;
        }
        Ok(())
    }
}
