//! Error types for todosync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from configuration, parsing, and path checks.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load; includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The config file did not exist at the expected path.
    #[error("config not found at {path}; run `todosync init` first")]
    ConfigNotFound { path: PathBuf },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Malformed Markdown task list.
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Path escapes its allowed root or contains `..` components.
    #[error("path traversal rejected: {path}")]
    PathTraversal { path: PathBuf },

    /// Path is unusable for a reason other than traversal.
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },
}

/// Convenience constructor for [`CoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`CoreError::Parse`].
pub(crate) fn parse_err(line: usize, message: impl Into<String>) -> CoreError {
    CoreError::Parse {
        line,
        message: message.into(),
    }
}
