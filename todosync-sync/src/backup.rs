//! Timestamped backups of the todo file.
//!
//! A backup of `TODO.md` is written next to it as
//! `TODO.md.backup-20261019T093000123Z`. The timestamp sorts
//! lexicographically, so pruning keeps the newest by name.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::fs::FileSystem;

const BACKUP_MARKER: &str = ".backup-";

/// `<path>.backup-<timestamp>` Pure, no I/O.
pub fn backup_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
    PathBuf::from(format!(
        "{}{BACKUP_MARKER}{}",
        path.display(),
        at.format("%Y%m%dT%H%M%S%3fZ")
    ))
}

fn is_backup_of(candidate: &Path, path: &Path) -> bool {
    let (Some(name), Some(file_name)) = (candidate.file_name(), path.file_name()) else {
        return false;
    };
    let prefix = format!("{}{BACKUP_MARKER}", file_name.to_string_lossy());
    name.to_string_lossy().starts_with(&prefix)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Backups of `path`, oldest first.
pub async fn list_backups(fs: &dyn FileSystem, path: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut backups: Vec<PathBuf> = fs
        .list_dir(&parent_dir(path))
        .await?
        .into_iter()
        .filter(|p| is_backup_of(p, path))
        .collect();
    backups.sort();
    Ok(backups)
}

/// Copy `path` to a fresh backup. Returns `None` when there is nothing to
/// back up.
pub async fn create_backup(
    fs: &dyn FileSystem,
    path: &Path,
    at: DateTime<Utc>,
) -> Result<Option<PathBuf>, SyncError> {
    if !fs.exists(path).await? {
        return Ok(None);
    }
    let target = backup_path(path, at);
    fs.copy_file(path, &target).await?;
    tracing::debug!(backup = %target.display(), "backed up todo file");
    Ok(Some(target))
}

/// Delete all but the newest `keep` backups of `path`. Returns the removed
/// paths.
pub async fn prune_backups(
    fs: &dyn FileSystem,
    path: &Path,
    keep: usize,
) -> Result<Vec<PathBuf>, SyncError> {
    let backups = list_backups(fs, path).await?;
    let excess = backups.len().saturating_sub(keep);
    let mut removed = Vec::with_capacity(excess);
    for old in backups.into_iter().take(excess) {
        fs.remove_file(&old).await?;
        removed.push(old);
    }
    if !removed.is_empty() {
        tracing::debug!(removed = removed.len(), keep, "pruned backups");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::fs::MemoryFileSystem;

    #[test]
    fn backup_name_is_sortable() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap() + Duration::milliseconds(7);
        let path = backup_path(Path::new("/work/TODO.md"), at);
        assert_eq!(path, PathBuf::from("/work/TODO.md.backup-20261019T093000007Z"));
    }

    #[tokio::test]
    async fn create_then_prune_keeps_newest() {
        let fs = MemoryFileSystem::new();
        let path = Path::new("/work/TODO.md");
        fs.insert(path, "# Tasks\n");
        fs.insert("/work/OTHER.md.backup-20200101T000000000Z", "x");

        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for i in 0..4 {
            create_backup(&fs, path, start + Duration::seconds(i))
                .await
                .unwrap()
                .unwrap();
        }
        let removed = prune_backups(&fs, path, 2).await.unwrap();
        assert_eq!(removed.len(), 2);

        let left = list_backups(&fs, path).await.unwrap();
        assert_eq!(
            left,
            [
                backup_path(path, start + Duration::seconds(2)),
                backup_path(path, start + Duration::seconds(3)),
            ]
        );
        assert!(fs.contents(Path::new("/work/OTHER.md.backup-20200101T000000000Z")).is_some());
    }

    #[tokio::test]
    async fn missing_file_has_nothing_to_back_up() {
        let fs = MemoryFileSystem::new();
        let created = create_backup(&fs, Path::new("/work/TODO.md"), Utc::now())
            .await
            .unwrap();
        assert!(created.is_none());
    }
}
