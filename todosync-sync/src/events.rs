//! Coordinator lifecycle state, cycle reports, and the events broadcast to
//! subscribers.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use todosync_core::SyncDirection;

use crate::merge::Conflict;

/// `Stopped → Starting → Idle ⇄ Syncing`, with `Error` entered on a
/// surfaced failure and left after the error cooldown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CoordinatorState {
    Stopped,
    Starting,
    Idle,
    Syncing,
    Error {
        since: DateTime<Utc>,
        message: String,
    },
}

impl CoordinatorState {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorState::Stopped => "stopped",
            CoordinatorState::Starting => "starting",
            CoordinatorState::Idle => "idle",
            CoordinatorState::Syncing => "syncing",
            CoordinatorState::Error { .. } => "error",
        }
    }

    /// Started and not yet stopped.
    pub fn is_running(&self) -> bool {
        !matches!(self, CoordinatorState::Stopped | CoordinatorState::Starting)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Error { message, .. } => write!(f, "error ({message})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    /// Nothing to write: the file was unchanged, missing, or already matched.
    NoChange,
    Failed,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Success => write!(f, "success"),
            SyncOutcome::NoChange => write!(f, "no_change"),
            SyncOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Result of one completed cycle in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub sync_id: Uuid,
    pub direction: SyncDirection,
    pub outcome: SyncOutcome,
    /// Tasks created or updated on the receiving side.
    pub tasks_written: usize,
    pub tasks_deleted: usize,
    /// Conflicts first detected in this cycle, with their resolution.
    pub conflicts: Vec<Conflict>,
    /// Manual conflicts still waiting after this cycle.
    pub pending_conflicts: usize,
    pub retries: u32,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    /// The store now holds values the file does not show yet.
    #[serde(default)]
    pub file_outdated: bool,
}

/// Broadcast by the coordinator. Receivers that lag lose the oldest events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted {
        sync_id: Uuid,
        direction: SyncDirection,
    },
    SyncCompleted(SyncReport),
    SyncError {
        sync_id: Uuid,
        direction: SyncDirection,
        kind: String,
        message: String,
    },
    ConflictDetected(Conflict),
}
