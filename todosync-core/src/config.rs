//! Sync configuration and its YAML persistence.
//!
//! # Storage layout
//!
//! ```text
//! ~/.todosync/
//!   config.yaml   (mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every persistence function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::path;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Which side(s) a sync propagates changes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    FileToApp,
    AppToFile,
    #[default]
    Bidirectional,
}

impl SyncDirection {
    pub fn includes_file_to_app(self) -> bool {
        matches!(self, SyncDirection::FileToApp | SyncDirection::Bidirectional)
    }

    pub fn includes_app_to_file(self) -> bool {
        matches!(self, SyncDirection::AppToFile | SyncDirection::Bidirectional)
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::FileToApp => write!(f, "file_to_app"),
            SyncDirection::AppToFile => write!(f, "app_to_file"),
            SyncDirection::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "file_to_app" => Ok(SyncDirection::FileToApp),
            "app_to_file" => Ok(SyncDirection::AppToFile),
            "bidirectional" | "both" => Ok(SyncDirection::Bidirectional),
            other => Err(format!(
                "unknown direction '{other}'; expected: file-to-app, app-to-file, bidirectional"
            )),
        }
    }
}

/// Top-level reconciliation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Whole tasks compared by `updated_at`; newer side wins.
    LastWriteWins,
    /// Field-level merge against the stored base version.
    #[default]
    ThreeWayMerge,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStrategy::LastWriteWins => write!(f, "last_write_wins"),
            SyncStrategy::ThreeWayMerge => write!(f, "three_way_merge"),
        }
    }
}

impl FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "last_write_wins" | "lww" => Ok(SyncStrategy::LastWriteWins),
            "three_way_merge" | "merge" => Ok(SyncStrategy::ThreeWayMerge),
            other => Err(format!(
                "unknown strategy '{other}'; expected: three-way-merge, last-write-wins"
            )),
        }
    }
}

/// Policy applied to field conflicts the three-way merge could not settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    PreferFile,
    PreferApp,
    #[default]
    LastWriteWins,
    Manual,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::PreferFile => write!(f, "prefer_file"),
            ConflictPolicy::PreferApp => write!(f, "prefer_app"),
            ConflictPolicy::LastWriteWins => write!(f, "last_write_wins"),
            ConflictPolicy::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "prefer_file" | "file" => Ok(ConflictPolicy::PreferFile),
            "prefer_app" | "app" => Ok(ConflictPolicy::PreferApp),
            "last_write_wins" | "lww" => Ok(ConflictPolicy::LastWriteWins),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(format!(
                "unknown conflict policy '{other}'; expected: prefer-file, prefer-app, last-write-wins, manual"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

/// Backoff parameters for retried I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of each delay added as random jitter (0.0–1.0).
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: 0.0,
        }
    }
}

/// Circuit breaker thresholds, shared by every guarded operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// The sole runtime configuration surface of a sync coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Markdown task list kept in sync with the app store.
    pub todo_path: PathBuf,
    #[serde(default)]
    pub direction: SyncDirection,
    #[serde(default)]
    pub strategy: SyncStrategy,
    #[serde(default)]
    pub conflict_resolution: ConflictPolicy,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    #[serde(default = "default_true")]
    pub auto_backup: bool,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_retention_days")]
    pub base_version_retention_days: u32,
    #[serde(default)]
    pub include_timestamps_in_hash: bool,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_error_cooldown_ms")]
    pub error_cooldown_ms: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
}

impl SyncConfig {
    /// Config for `todo_path` with every other field at its default.
    pub fn new(todo_path: impl Into<PathBuf>) -> Self {
        Self {
            todo_path: todo_path.into(),
            direction: SyncDirection::default(),
            strategy: SyncStrategy::default(),
            conflict_resolution: ConflictPolicy::default(),
            debounce_ms: default_debounce_ms(),
            throttle_ms: default_throttle_ms(),
            max_file_size_mb: default_max_file_size_mb(),
            max_tasks: default_max_tasks(),
            auto_backup: true,
            max_backups: default_max_backups(),
            history_limit: default_history_limit(),
            base_version_retention_days: default_retention_days(),
            include_timestamps_in_hash: false,
            stop_timeout_ms: default_stop_timeout_ms(),
            error_cooldown_ms: default_error_cooldown_ms(),
            retry: RetrySettings::default(),
            circuit_breaker: BreakerSettings::default(),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    /// Check path safety and numeric limits.
    ///
    /// Returns [`CoreError::PathTraversal`] / [`CoreError::InvalidPath`] for
    /// an unsafe `todo_path` and [`CoreError::InvalidConfig`] for any limit
    /// out of range.
    pub fn validate(&self) -> Result<(), CoreError> {
        path::validate_todo_path(&self.todo_path)?;

        if self.max_file_size_mb == 0 {
            return Err(invalid("max_file_size_mb must be at least 1"));
        }
        if self.max_tasks == 0 {
            return Err(invalid("max_tasks must be at least 1"));
        }
        if self.history_limit == 0 {
            return Err(invalid("history_limit must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if !(self.retry.multiplier > 1.0) {
            return Err(invalid("retry.multiplier must be greater than 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(invalid("retry.jitter must be within 0.0..=1.0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms must be >= retry.base_delay_ms"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> CoreError {
    CoreError::InvalidConfig(message.to_string())
}

fn default_true() -> bool {
    true
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_throttle_ms() -> u64 {
    1_000
}
fn default_max_file_size_mb() -> u64 {
    10
}
fn default_max_tasks() -> usize {
    10_000
}
fn default_max_backups() -> usize {
    10
}
fn default_history_limit() -> usize {
    100
}
fn default_retention_days() -> u32 {
    30
}
fn default_stop_timeout_ms() -> u64 {
    5_000
}
fn default_error_cooldown_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window_ms() -> u64 {
    60_000
}
fn default_cooldown_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// `<home>/.todosync/` Pure, no I/O.
pub fn root_dir_at(home: &Path) -> PathBuf {
    home.join(".todosync")
}

/// `<home>/.todosync/config.yaml` Pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    root_dir_at(home).join("config.yaml")
}

/// Load the config from `<home>/.todosync/config.yaml`.
///
/// Returns `CoreError::ConfigNotFound` if absent,
/// `CoreError::ConfigParse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<SyncConfig, CoreError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(CoreError::ConfigNotFound { path });
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_yaml::from_str(&contents).map_err(|e| CoreError::ConfigParse { path, source: e })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, CoreError> {
    load_at(&home()?)
}

/// Atomically save the config to `<home>/.todosync/config.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<PathBuf, CoreError> {
    let dir = root_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        set_dir_permissions(&dir)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

/// `save_at` convenience wrapper.
pub fn save(config: &SyncConfig) -> Result<PathBuf, CoreError> {
    save_at(&home()?, config)
}

/// Resolve the user's home directory.
pub fn home() -> Result<PathBuf, CoreError> {
    dirs::home_dir().ok_or(CoreError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
