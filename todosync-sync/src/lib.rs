//! # todosync-sync
//!
//! Bidirectional sync between a Markdown task file and a task store.
//!
//! [`SyncCoordinator`] owns the lifecycle and both sync directions. The
//! pieces it is built from are usable on their own: [`DiffDetector`],
//! [`ThreeWayMerger`], [`ConflictResolver`], [`RetryPolicy`],
//! [`CircuitBreaker`], [`BatchWriter`] and [`SyncStateManager`].
//!
//! Collaborators are traits with a real adapter and an in-memory double:
//! [`FileSystem`], [`Database`], [`StateBackend`] and [`FileWatcher`].

pub mod backup;
pub mod batch;
pub mod breaker;
pub mod conflict;
pub mod coordinator;
pub mod db;
pub mod diff;
pub mod error;
pub mod events;
pub mod fs;
pub mod merge;
pub mod preview;
pub mod retry;
pub mod state;
pub mod stats;
pub mod watcher;

pub use batch::{BatchReport, BatchWriter, ItemOutcome, ItemReport, TaskMutation};
pub use breaker::{BreakerState, CircuitBreaker};
pub use conflict::{ConflictResolver, ResolutionOutcome};
pub use coordinator::{BreakerStates, SyncCoordinator, SyncDependencies};
pub use db::{Database, JsonFileDatabase, MemoryDatabase, TaskTransaction};
pub use diff::{DiffDetector, TaskDiff};
pub use error::SyncError;
pub use events::{CoordinatorState, SyncEvent, SyncOutcome, SyncReport};
pub use fs::{FileStat, FileSystem, LocalFileSystem, MemoryFileSystem};
pub use merge::{Conflict, ConflictKind, MergeOutcome, Resolution, Side, TaskField, TaskVersion, ThreeWayMerger};
pub use preview::Preview;
pub use retry::RetryPolicy;
pub use state::{BaseVersion, JsonStateBackend, MemoryStateBackend, StateBackend, SyncState, SyncStateManager};
pub use stats::{HistoryEntry, SyncStatistics};
pub use watcher::{FileEvent, FileWatcher, ManualWatcher, NotifyWatcher, WatchGuard};
