use std::path::{Path, PathBuf};

use todosync_core::config::root_dir_at;

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const TASKS_FILE: &str = "tasks.json";

pub fn run_dir(home: &Path) -> PathBuf {
    root_dir_at(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_SOCKET)
}

/// The app-side task store used by the daemon and the CLI.
pub fn tasks_path(home: &Path) -> PathBuf {
    root_dir_at(home).join(TASKS_FILE)
}
