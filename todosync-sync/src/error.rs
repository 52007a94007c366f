//! Error types for todosync-sync.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use todosync_core::{CoreError, TaskId};

use crate::batch::BatchReport;

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed Markdown. The cycle is skipped; the file is left untouched.
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Unsafe path. Fatal at `start()`, never retried.
    #[error("path traversal rejected: {path}")]
    PathTraversal { path: PathBuf },

    /// Config or input outside accepted limits. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Timeout, lock contention or an interrupted call. Retried per policy.
    #[error("transient I/O error during {operation} at {path}: {source}")]
    TransientIo {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persistent I/O failure. Surfaced and counted by the circuit breaker.
    #[error("I/O error during {operation} at {path}: {source}")]
    FatalIo {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The guarded operation's breaker is open; the operation was not invoked.
    #[error("circuit '{operation}' is open; retry in {retry_after:?}")]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    /// The sync state store could not be read or written.
    #[error("sync state unavailable: {0}")]
    StateUnavailable(String),

    /// A mutation failed inside a batch; the whole transaction rolled back.
    #[error("batch rolled back at task {failed}: {source}")]
    BatchAborted {
        failed: TaskId,
        #[source]
        source: Box<SyncError>,
        report: Box<BatchReport>,
    },

    /// `resolve_conflict` named a task with no pending conflict.
    #[error("no pending conflict for task {task_id}")]
    UnknownConflict { task_id: TaskId },

    /// Lifecycle call made in the wrong coordinator state.
    #[error("coordinator is {actual}; expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    /// JSON (de)serialization of the task store or sync state.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The file watcher could not be registered.
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// A blocking worker panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(String),
}

impl SyncError {
    /// Retried by [`crate::retry::RetryPolicy`].
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::TransientIo { .. } => true,
            SyncError::BatchAborted { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Counted as a failure by [`crate::breaker::CircuitBreaker`].
    pub fn counts_as_failure(&self) -> bool {
        match self {
            SyncError::TransientIo { .. }
            | SyncError::FatalIo { .. }
            | SyncError::Json(_)
            | SyncError::Join(_) => true,
            SyncError::BatchAborted { source, .. } => source.counts_as_failure(),
            _ => false,
        }
    }

    /// Escapes the cycle as a `sync-error` event and moves the coordinator
    /// into its error state. Everything else is absorbed and logged.
    pub fn is_surfaced(&self) -> bool {
        !matches!(
            self,
            SyncError::Parse { .. }
                | SyncError::PathTraversal { .. }
                | SyncError::Validation(_)
                | SyncError::UnknownConflict { .. }
                | SyncError::InvalidState { .. }
        )
    }

    /// Short machine-readable category, recorded in sync history.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Parse { .. } => "parse",
            SyncError::PathTraversal { .. } => "path_traversal",
            SyncError::Validation(_) => "validation",
            SyncError::TransientIo { .. } => "transient_io",
            SyncError::FatalIo { .. } => "fatal_io",
            SyncError::CircuitOpen { .. } => "circuit_open",
            SyncError::StateUnavailable(_) => "state_unavailable",
            SyncError::BatchAborted { .. } => "batch_aborted",
            SyncError::UnknownConflict { .. } => "unknown_conflict",
            SyncError::InvalidState { .. } => "invalid_state",
            SyncError::Json(_) => "json",
            SyncError::Watcher(_) => "watcher",
            SyncError::Join(_) => "join",
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Parse { line, message } => SyncError::Parse { line, message },
            CoreError::PathTraversal { path } => SyncError::PathTraversal { path },
            CoreError::Io { path, source } => io_err("config", path, source),
            other => SyncError::Validation(other.to_string()),
        }
    }
}

/// Classify an I/O error for `operation` on `path`.
///
/// Timeouts, would-block (lock contention) and interrupted calls are
/// transient; everything else is fatal.
pub fn io_err(operation: &str, path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    let path = path.into();
    let operation = operation.to_string();
    match source.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            SyncError::TransientIo {
                operation,
                path,
                source,
            }
        }
        _ => SyncError::FatalIo {
            operation,
            path,
            source,
        },
    }
}
