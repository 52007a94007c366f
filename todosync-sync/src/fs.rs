//! File system capability used for the todo file and its backups.
//!
//! [`LocalFileSystem`] talks to the real disk through `tokio::fs`; writes go
//! through a `<path>.todosync.tmp` sibling and an atomic rename.
//! [`MemoryFileSystem`] keeps files in a map and can inject failures.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{io_err, SyncError};

/// Size and modification time of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Raw file primitives. Content is always UTF-8 text; errors carry the path.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read_file(&self, path: &Path) -> Result<String, SyncError>;
    async fn write_file(&self, path: &Path, content: &str) -> Result<(), SyncError>;
    async fn stat(&self, path: &Path) -> Result<FileStat, SyncError>;
    async fn exists(&self, path: &Path) -> Result<bool, SyncError>;
    async fn copy_file(&self, from: &Path, to: &Path) -> Result<(), SyncError>;
    async fn remove_file(&self, path: &Path) -> Result<(), SyncError>;
    /// Entries directly inside `dir`, sorted by path.
    async fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, SyncError>;
}

// ---------------------------------------------------------------------------
// Local disk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

/// `<path>.todosync.tmp`
pub fn tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.todosync.tmp", path.display()))
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn read_file(&self, path: &Path) -> Result<String, SyncError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| io_err("read", path, e))?;
        String::from_utf8(bytes).map_err(|e| {
            io_err(
                "read",
                path,
                std::io::Error::new(ErrorKind::InvalidData, e.utf8_error()),
            )
        })
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<(), SyncError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err("create_dir", parent, e))?;
        }
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| io_err("write", &tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err("rename", path, e));
        }
        tracing::debug!(path = %path.display(), bytes = content.len(), "wrote file");
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, SyncError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| io_err("stat", path, e))?;
        let modified = meta.modified().map_err(|e| io_err("stat", path, e))?;
        Ok(FileStat {
            size: meta.len(),
            modified: DateTime::<Utc>::from(modified),
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool, SyncError> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| io_err("exists", path, e))
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> Result<(), SyncError> {
        tokio::fs::copy(from, to)
            .await
            .map(|_| ())
            .map_err(|e| io_err("copy", to, e))
    }

    async fn remove_file(&self, path: &Path) -> Result<(), SyncError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| io_err("remove", path, e))
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| io_err("list_dir", dir, e))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err("list_dir", dir, e))?
        {
            paths.push(entry.path());
        }
        paths.sort();
        Ok(paths)
    }
}

// ---------------------------------------------------------------------------
// In-memory double
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemFile {
    content: String,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Faults {
    reads: usize,
    writes: usize,
    kind: Option<ErrorKind>,
}

/// In-memory [`FileSystem`] with injectable read/write failures.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: Mutex<BTreeMap<PathBuf, MemFile>>,
    faults: Mutex<Faults>,
    read_delay: Mutex<std::time::Duration>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file without counting it as a write.
    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.lock().insert(
            path.into(),
            MemFile {
                content: content.into(),
                modified: Utc::now(),
            },
        );
    }

    pub fn contents(&self, path: &Path) -> Option<String> {
        self.files.lock().get(path).map(|f| f.content.clone())
    }

    pub fn set_modified(&self, path: &Path, modified: DateTime<Utc>) {
        if let Some(file) = self.files.lock().get_mut(path) {
            file.modified = modified;
        }
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.lock().keys().cloned().collect()
    }

    /// Fail the next `count` reads with `kind`. `usize::MAX` fails forever.
    pub fn fail_reads(&self, count: usize, kind: ErrorKind) {
        let mut faults = self.faults.lock();
        faults.reads = count;
        faults.kind = Some(kind);
    }

    /// Fail the next `count` writes (including copies) with `kind`.
    pub fn fail_writes(&self, count: usize, kind: ErrorKind) {
        let mut faults = self.faults.lock();
        faults.writes = count;
        faults.kind = Some(kind);
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Make every read take `delay` (tokio time).
    pub fn slow_reads(&self, delay: std::time::Duration) {
        *self.read_delay.lock() = delay;
    }

    /// Read attempts, including failed ones.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Write and copy attempts, including failed ones.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn injected(&self, write: bool) -> Option<ErrorKind> {
        let mut faults = self.faults.lock();
        let kind = faults.kind?;
        let remaining = if write {
            &mut faults.writes
        } else {
            &mut faults.reads
        };
        match *remaining {
            0 => None,
            usize::MAX => Some(kind),
            _ => {
                *remaining -= 1;
                Some(kind)
            }
        }
    }

    fn not_found(operation: &str, path: &Path) -> SyncError {
        io_err(operation, path, ErrorKind::NotFound.into())
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn read_file(&self, path: &Path) -> Result<String, SyncError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(kind) = self.injected(false) {
            return Err(io_err("read", path, kind.into()));
        }
        self.contents(path)
            .ok_or_else(|| Self::not_found("read", path))
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<(), SyncError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.injected(true) {
            return Err(io_err("write", path, kind.into()));
        }
        self.insert(path, content);
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, SyncError> {
        let files = self.files.lock();
        let file = files.get(path).ok_or_else(|| Self::not_found("stat", path))?;
        Ok(FileStat {
            size: file.content.len() as u64,
            modified: file.modified,
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool, SyncError> {
        Ok(self.files.lock().contains_key(path))
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> Result<(), SyncError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.injected(true) {
            return Err(io_err("copy", to, kind.into()));
        }
        let content = self
            .contents(from)
            .ok_or_else(|| Self::not_found("copy", from))?;
        self.insert(to, content);
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<(), SyncError> {
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("remove", path))
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
        Ok(self
            .files
            .lock()
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect())
    }
}
