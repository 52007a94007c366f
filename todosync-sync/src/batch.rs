//! Atomic multi-task writes against the app store.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use todosync_core::{Task, TaskId};

use crate::db::{Database, TaskTransaction};
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskMutation {
    Upsert(Task),
    Delete(TaskId),
}

impl TaskMutation {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskMutation::Upsert(task) => &task.id,
            TaskMutation::Delete(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ItemOutcome {
    Applied,
    Failed(String),
    /// Not attempted because an earlier item failed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    pub task_id: TaskId,
    pub outcome: ItemOutcome,
}

/// Per-item outcome of a batch. When `committed` is false the store is
/// unchanged, including for items reported as applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
    pub committed: bool,
}

impl BatchReport {
    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Applied))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped))
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|i| pred(&i.outcome)).count()
    }
}

/// Applies a list of mutations in a single [`Database::transaction`].
#[derive(Clone)]
pub struct BatchWriter {
    db: Arc<dyn Database>,
}

impl BatchWriter {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Commit every mutation or none of them.
    ///
    /// An item failure rolls the transaction back and returns
    /// [`SyncError::BatchAborted`] carrying the report. A transaction that
    /// fails before any item ran returns the store's error unchanged so the
    /// caller can retry it.
    pub async fn commit(&self, mutations: Vec<TaskMutation>) -> Result<BatchReport, SyncError> {
        let initial: Vec<ItemReport> = mutations
            .iter()
            .map(|m| ItemReport {
                task_id: m.task_id().clone(),
                outcome: ItemOutcome::Skipped,
            })
            .collect();
        if mutations.is_empty() {
            return Ok(BatchReport {
                items: initial,
                committed: true,
            });
        }

        let items = Arc::new(Mutex::new(initial));
        let recorder = Arc::clone(&items);
        let result = self
            .db
            .transaction(Box::new(move |tx: &mut dyn TaskTransaction| {
                for (index, mutation) in mutations.into_iter().enumerate() {
                    let applied = match mutation {
                        TaskMutation::Upsert(task) => tx.upsert(task),
                        TaskMutation::Delete(id) => tx.delete(&id).map(|_| ()),
                    };
                    let mut items = recorder.lock();
                    match applied {
                        Ok(()) => items[index].outcome = ItemOutcome::Applied,
                        Err(e) => {
                            items[index].outcome = ItemOutcome::Failed(e.to_string());
                            return Err(e);
                        }
                    }
                }
                Ok(())
            }))
            .await;

        let items = std::mem::take(&mut *items.lock());
        match result {
            Ok(()) => {
                let report = BatchReport {
                    items,
                    committed: true,
                };
                tracing::debug!(applied = report.applied(), "batch committed");
                Ok(report)
            }
            Err(source) => {
                let failed = items
                    .iter()
                    .find(|i| matches!(i.outcome, ItemOutcome::Failed(_)))
                    .map(|i| i.task_id.clone());
                let Some(failed) = failed else {
                    return Err(source);
                };
                tracing::warn!(task_id = %failed, error = %source, "batch rolled back");
                Err(SyncError::BatchAborted {
                    failed,
                    source: Box::new(source),
                    report: Box::new(BatchReport {
                        items,
                        committed: false,
                    }),
                })
            }
        }
    }
}
