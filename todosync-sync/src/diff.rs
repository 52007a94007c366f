//! Snapshot diffing based on content hashes.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use todosync_core::{Task, TaskId};

/// A task present in both snapshots whose content hash changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskChange {
    pub before: Task,
    pub after: Task,
}

/// Difference between two task snapshots, each list ordered by task id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDiff {
    pub added: Vec<Task>,
    pub updated: Vec<TaskChange>,
    pub removed: Vec<Task>,
}

impl TaskDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    /// Every id touched by the diff, ascending.
    pub fn ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .added
            .iter()
            .map(|t| t.id.clone())
            .chain(self.updated.iter().map(|c| c.after.id.clone()))
            .chain(self.removed.iter().map(|t| t.id.clone()))
            .collect();
        ids.sort();
        ids
    }
}

/// Computes content hashes and snapshot diffs. Pure.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffDetector {
    include_timestamps: bool,
}

impl DiffDetector {
    pub fn new(include_timestamps: bool) -> Self {
        Self { include_timestamps }
    }

    /// SHA-256 over the task's normalized significant fields.
    ///
    /// The title is trimmed and labels are sorted and de-duplicated. Creation
    /// and update timestamps only take part when the detector was built with
    /// `include_timestamps`.
    pub fn hash(&self, task: &Task) -> String {
        let mut labels: Vec<&str> = task.labels.iter().map(|l| l.trim()).collect();
        labels.sort_unstable();
        labels.dedup();

        let mut h = Sha256::new();
        let mut field = |value: &str| {
            h.update(value.as_bytes());
            h.update([0x1f_u8]);
        };
        field(task.id.as_str());
        field(task.title.trim());
        field(&task.status.to_string());
        field(&task.priority.to_string());
        field(task.board_id.as_deref().unwrap_or(""));
        field(task.column_id.as_deref().unwrap_or(""));
        field(&task.due_date.map(|d| d.to_string()).unwrap_or_default());
        field(&labels.join("\u{1e}"));
        for subtask in &task.subtasks {
            field(if subtask.done { "x" } else { " " });
            field(subtask.title.trim());
        }
        if self.include_timestamps {
            field(&task.created_at.to_rfc3339());
            field(&task.updated_at.to_rfc3339());
        }
        hex::encode(h.finalize())
    }

    /// Two tasks carry the same content.
    pub fn same_content(&self, a: &Task, b: &Task) -> bool {
        self.hash(a) == self.hash(b)
    }

    /// Compare `previous` with `current` by task id.
    pub fn detect(&self, previous: &[Task], current: &[Task]) -> TaskDiff {
        let before: BTreeMap<&TaskId, &Task> = previous.iter().map(|t| (&t.id, t)).collect();
        let after: BTreeMap<&TaskId, &Task> = current.iter().map(|t| (&t.id, t)).collect();

        let mut diff = TaskDiff::default();
        for (id, task) in &after {
            match before.get(id) {
                None => diff.added.push((*task).clone()),
                Some(old) if !self.same_content(old, task) => diff.updated.push(TaskChange {
                    before: (*old).clone(),
                    after: (*task).clone(),
                }),
                Some(_) => {}
            }
        }
        diff.removed = before
            .iter()
            .filter(|(id, _)| !after.contains_key(*id))
            .map(|(_, t)| (*t).clone())
            .collect();
        diff
    }
}

/// SHA-256 hex digest of file content, with CRLF normalized to LF.
pub fn content_digest(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n");
    let mut h = Sha256::new();
    h.update(normalized.as_bytes());
    hex::encode(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use todosync_core::TaskStatus;

    fn task(id: &str, title: &str) -> Task {
        Task::new(id, title, Utc::now())
    }

    #[test]
    fn detects_added_updated_and_removed_in_id_order() {
        let previous = vec![task("b", "keep"), task("c", "change"), task("d", "gone")];
        let mut changed = task("c", "change");
        changed.status = TaskStatus::Done;
        let current = vec![task("z", "new"), changed, task("b", "keep"), task("a", "new too")];

        let diff = DiffDetector::default().detect(&previous, &current);
        let added: Vec<_> = diff.added.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(added, ["a", "z"]);
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].after.status, TaskStatus::Done);
        assert_eq!(diff.removed[0].id.as_str(), "d");
        assert_eq!(diff.len(), 4);
    }

    #[test]
    fn normalization_ignores_whitespace_and_label_order() {
        let mut a = task("t", "  Title ");
        a.labels = vec!["b".into(), "a".into(), "a".into()];
        let mut b = task("t", "Title");
        b.labels = vec!["a".into(), "b".into()];
        assert!(DiffDetector::default().same_content(&a, &b));
    }

    #[test]
    fn timestamps_only_count_when_enabled() {
        let a = task("t", "Title");
        let mut b = a.clone();
        b.updated_at = a.updated_at + Duration::hours(1);

        assert!(DiffDetector::new(false).same_content(&a, &b));
        assert!(!DiffDetector::new(true).same_content(&a, &b));
    }

    #[test]
    fn digest_normalizes_line_endings() {
        assert_eq!(content_digest("a\r\nb\r\n"), content_digest("a\nb\n"));
        assert_ne!(content_digest("a"), content_digest("b"));
    }
}
