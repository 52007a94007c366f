//! Domain types shared by the file side and the app side of a sync.
//!
//! A [`Task`] is identified by its [`TaskId`]; every other field may be
//! edited from either side. All types are serde-serializable so the same
//! structs back the JSON task store, the sync state file, and the daemon
//! protocol.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Workflow status of a task. `Archived` is the soft-delete state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Blocked,
    Done,
    Archived,
}

impl TaskStatus {
    /// The character used inside the checkbox `[ ]`.
    pub fn checkbox_char(self) -> char {
        match self {
            TaskStatus::Todo => ' ',
            TaskStatus::InProgress => '>',
            TaskStatus::Blocked => '-',
            TaskStatus::Done => 'x',
            TaskStatus::Archived => '~',
        }
    }

    /// Parse a checkbox character into a status. `X` is accepted for done.
    pub fn from_checkbox_char(c: char) -> Option<TaskStatus> {
        match c {
            ' ' => Some(TaskStatus::Todo),
            '>' => Some(TaskStatus::InProgress),
            '-' => Some(TaskStatus::Blocked),
            'x' | 'X' => Some(TaskStatus::Done),
            '~' => Some(TaskStatus::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Todo => write!(f, "todo"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Blocked => write!(f, "blocked"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Archived => write!(f, "archived"),
        }
    }
}

/// Task priority. Serialized lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!(
                "unknown priority '{other}'; expected: low, medium, high, urgent"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A checklist item nested under a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subtask {
    pub title: String,
    #[serde(default)]
    pub done: bool,
}

/// A single task as stored in the app database and rendered in the todo file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A `todo`/`medium` task with no metadata, stamped with `now`.
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: TaskStatus::default(),
            priority: Priority::default(),
            board_id: None,
            column_id: None,
            due_date: None,
            labels: Vec::new(),
            subtasks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.status == TaskStatus::Archived
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(TaskId::from("t-01").to_string(), "t-01");
        assert_eq!(TaskId::from(String::from("x")), TaskId::from("x"));
    }

    #[test]
    fn checkbox_chars_roundtrip() {
        for status in [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Done,
            TaskStatus::Archived,
        ] {
            assert_eq!(
                TaskStatus::from_checkbox_char(status.checkbox_char()),
                Some(status)
            );
        }
        assert_eq!(TaskStatus::from_checkbox_char('X'), Some(TaskStatus::Done));
        assert_eq!(TaskStatus::from_checkbox_char('?'), None);
    }

    #[test]
    fn priority_parse_and_display() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(Priority::Urgent.to_string(), "urgent");
        assert!("critical".parse::<Priority>().is_err());
    }

    #[test]
    fn task_serde_roundtrip_skips_empty_options() {
        let now = Utc::now();
        let task = Task::new("t-1", "Buy milk", now);
        let yaml = serde_yaml::to_string(&task).expect("serialize");
        assert!(!yaml.contains("board_id"));
        let back: Task = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(back, task);
    }
}
