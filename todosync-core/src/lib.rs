//! todosync core library: domain types, configuration, Markdown codec, errors.
//!
//! Public API surface:
//! - [`types`]: tasks and their newtypes/enums
//! - [`config`]: [`SyncConfig`] and its YAML persistence
//! - [`markdown`]: task list parser and serializer
//! - [`path`]: todo file path validation
//! - [`error`]: [`CoreError`]

pub mod config;
pub mod error;
pub mod markdown;
pub mod path;
pub mod types;

pub use config::{
    BreakerSettings, ConflictPolicy, RetrySettings, SyncConfig, SyncDirection, SyncStrategy,
};
pub use error::CoreError;
pub use types::{Priority, Subtask, Task, TaskId, TaskStatus};
