//! Three-way task merge.
//!
//! Each side of a sync contributes a [`TaskVersion`]: the file, the app
//! store, and the base recorded at the last successful sync. Fields are
//! merged independently; a field both sides changed in different ways is a
//! conflict.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use todosync_core::{Task, TaskId};

// ---------------------------------------------------------------------------
// Versions and fields
// ---------------------------------------------------------------------------

/// One side's view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "task", rename_all = "snake_case")]
pub enum TaskVersion {
    Present(Task),
    Absent,
}

impl TaskVersion {
    pub fn as_task(&self) -> Option<&Task> {
        match self {
            TaskVersion::Present(task) => Some(task),
            TaskVersion::Absent => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, TaskVersion::Present(_))
    }
}

impl From<Option<Task>> for TaskVersion {
    fn from(task: Option<Task>) -> Self {
        task.map_or(TaskVersion::Absent, TaskVersion::Present)
    }
}

/// Which side of the sync a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    File,
    App,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::File => write!(f, "file"),
            Side::App => write!(f, "app"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Side::File),
            "app" | "db" => Ok(Side::App),
            other => Err(format!("unknown side '{other}'; expected: file, app")),
        }
    }
}

/// A mergeable task field. Timestamps are derived, never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskField {
    Title,
    Status,
    Priority,
    BoardId,
    ColumnId,
    DueDate,
    Labels,
    Subtasks,
}

impl TaskField {
    pub const ALL: [TaskField; 8] = [
        TaskField::Title,
        TaskField::Status,
        TaskField::Priority,
        TaskField::BoardId,
        TaskField::ColumnId,
        TaskField::DueDate,
        TaskField::Labels,
        TaskField::Subtasks,
    ];

    pub fn equal(self, a: &Task, b: &Task) -> bool {
        match self {
            TaskField::Title => a.title.trim() == b.title.trim(),
            TaskField::Status => a.status == b.status,
            TaskField::Priority => a.priority == b.priority,
            TaskField::BoardId => a.board_id == b.board_id,
            TaskField::ColumnId => a.column_id == b.column_id,
            TaskField::DueDate => a.due_date == b.due_date,
            TaskField::Labels => normalized_labels(a) == normalized_labels(b),
            TaskField::Subtasks => a.subtasks == b.subtasks,
        }
    }

    /// Copy this field's value from `from` into `to`.
    pub fn copy(self, from: &Task, to: &mut Task) {
        match self {
            TaskField::Title => to.title = from.title.clone(),
            TaskField::Status => to.status = from.status,
            TaskField::Priority => to.priority = from.priority,
            TaskField::BoardId => to.board_id = from.board_id.clone(),
            TaskField::ColumnId => to.column_id = from.column_id.clone(),
            TaskField::DueDate => to.due_date = from.due_date,
            TaskField::Labels => to.labels = from.labels.clone(),
            TaskField::Subtasks => to.subtasks = from.subtasks.clone(),
        }
    }
}

impl fmt::Display for TaskField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskField::Title => "title",
            TaskField::Status => "status",
            TaskField::Priority => "priority",
            TaskField::BoardId => "board_id",
            TaskField::ColumnId => "column_id",
            TaskField::DueDate => "due_date",
            TaskField::Labels => "labels",
            TaskField::Subtasks => "subtasks",
        };
        f.write_str(name)
    }
}

fn normalized_labels(task: &Task) -> Vec<&str> {
    let mut labels: Vec<&str> = task.labels.iter().map(|l| l.trim()).collect();
    labels.sort_unstable();
    labels.dedup();
    labels
}

/// Every mergeable field is equal.
pub fn same_fields(a: &Task, b: &Task) -> bool {
    TaskField::ALL.iter().all(|f| f.equal(a, b))
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides edited the same field(s) differently.
    Fields,
    /// One side deleted the task while the other edited it.
    DeleteEdit { deleted_on: Side },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Pending,
    Resolved { chosen: Side },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub task_id: TaskId,
    pub kind: ConflictKind,
    pub base: TaskVersion,
    pub file: TaskVersion,
    pub app: TaskVersion,
    /// Empty for delete/edit conflicts.
    pub fields: Vec<TaskField>,
    /// Non-conflicting fields already merged; `None` for delete/edit.
    pub merged: Option<Task>,
    pub resolution: Resolution,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::Pending
    }

    pub fn version(&self, side: Side) -> &TaskVersion {
        match side {
            Side::File => &self.file,
            Side::App => &self.app,
        }
    }

    /// Comma-separated field names, or `delete/edit`.
    pub fn describe(&self) -> String {
        match self.kind {
            ConflictKind::Fields => self
                .fields
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            ConflictKind::DeleteEdit { deleted_on } => format!("deleted on {deleted_on}, edited on the other side"),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(Task),
    /// Neither side should keep the task.
    Deleted,
    Conflict(Conflict),
}

/// Field-level three-way merge. Pure.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreeWayMerger;

impl ThreeWayMerger {
    pub fn new() -> Self {
        Self
    }

    pub fn merge(
        &self,
        task_id: &TaskId,
        base: &TaskVersion,
        file: &TaskVersion,
        app: &TaskVersion,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        match (file.as_task(), app.as_task()) {
            (None, None) => MergeOutcome::Deleted,
            (Some(present), None) => {
                self.one_sided(task_id, base, file, app, present, Side::App, now)
            }
            (None, Some(present)) => {
                self.one_sided(task_id, base, file, app, present, Side::File, now)
            }
            (Some(f), Some(a)) => self.both_present(task_id, base, f, a, now),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn one_sided(
        &self,
        task_id: &TaskId,
        base: &TaskVersion,
        file: &TaskVersion,
        app: &TaskVersion,
        present: &Task,
        deleted_on: Side,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        match base.as_task() {
            // New on the present side.
            None => MergeOutcome::Merged(present.clone()),
            Some(b) if same_fields(b, present) => MergeOutcome::Deleted,
            Some(_) => MergeOutcome::Conflict(Conflict {
                task_id: task_id.clone(),
                kind: ConflictKind::DeleteEdit { deleted_on },
                base: base.clone(),
                file: file.clone(),
                app: app.clone(),
                fields: Vec::new(),
                merged: None,
                resolution: Resolution::Pending,
                detected_at: now,
            }),
        }
    }

    fn both_present(
        &self,
        task_id: &TaskId,
        base: &TaskVersion,
        file: &Task,
        app: &Task,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let mut merged = file.clone();
        let mut conflicts = Vec::new();

        for field in TaskField::ALL {
            if field.equal(file, app) {
                continue;
            }
            match base.as_task() {
                Some(b) if field.equal(file, b) => field.copy(app, &mut merged),
                Some(b) if field.equal(app, b) => {}
                _ => conflicts.push(field),
            }
        }

        merged.updated_at = file.updated_at.max(app.updated_at);
        merged.created_at = file.created_at.min(app.created_at);
        if let Some(b) = base.as_task() {
            merged.created_at = merged.created_at.min(b.created_at);
        }

        if conflicts.is_empty() {
            return MergeOutcome::Merged(merged);
        }
        MergeOutcome::Conflict(Conflict {
            task_id: task_id.clone(),
            kind: ConflictKind::Fields,
            base: base.clone(),
            file: TaskVersion::Present(file.clone()),
            app: TaskVersion::Present(app.clone()),
            fields: conflicts,
            merged: Some(merged),
            resolution: Resolution::Pending,
            detected_at: now,
        })
    }
}

/// Whole-task reconciliation by `updated_at`; never produces a conflict.
///
/// Both present: the newer side wins, ties go to the file. One side absent:
/// the deletion wins when the remaining side is unchanged from base, and
/// the remaining side wins otherwise (including when there is no base).
pub fn last_write_wins(base: &TaskVersion, file: &TaskVersion, app: &TaskVersion) -> MergeOutcome {
    match (file.as_task(), app.as_task()) {
        (None, None) => MergeOutcome::Deleted,
        (Some(f), Some(a)) => {
            let winner = if f.updated_at >= a.updated_at { f } else { a };
            let mut task = winner.clone();
            task.created_at = f.created_at.min(a.created_at);
            MergeOutcome::Merged(task)
        }
        (Some(present), None) | (None, Some(present)) => match base.as_task() {
            Some(b) if same_fields(b, present) => MergeOutcome::Deleted,
            _ => MergeOutcome::Merged(present.clone()),
        },
    }
}
