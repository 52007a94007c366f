//! File change notifications for the todo file.
//!
//! A watcher only forwards [`FileEvent`]s into the channel it was handed;
//! debouncing and coalescing happen in the coordinator's event loop.
//! Dropping the returned [`WatchGuard`] unregisters the watch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
}

/// Keeps a watch registration alive.
pub struct WatchGuard {
    _registration: Box<dyn Send>,
}

impl WatchGuard {
    pub fn new(registration: impl Send + 'static) -> Self {
        Self {
            _registration: Box::new(registration),
        }
    }
}

pub trait FileWatcher: Send + Sync {
    fn watch(&self, path: &Path, events: UnboundedSender<FileEvent>) -> Result<WatchGuard, SyncError>;
}

// ---------------------------------------------------------------------------
// notify-backed watcher
// ---------------------------------------------------------------------------

/// Watches the todo file's parent directory (non-recursive) so atomic
/// rename-over writes are seen, and filters events down to the file itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyWatcher;

impl NotifyWatcher {
    pub fn new() -> Self {
        Self
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

impl FileWatcher for NotifyWatcher {
    fn watch(&self, path: &Path, events: UnboundedSender<FileEvent>) -> Result<WatchGuard, SyncError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        // Event paths arrive canonicalized on some platforms.
        let dir = std::fs::canonicalize(&dir).unwrap_or(dir);
        let Some(file_name) = path.file_name().map(|n| n.to_os_string()) else {
            return Err(SyncError::Validation(format!(
                "cannot watch {}: no file name",
                path.display()
            )));
        };
        let target = path.to_path_buf();

        let mut watcher = recommended_watcher(move |event: notify::Result<Event>| {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "watcher event error");
                    return;
                }
            };
            if !is_relevant_event_kind(&event.kind) {
                return;
            }
            if event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()))
            {
                let _ = events.send(FileEvent {
                    path: target.clone(),
                });
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::debug!(path = %path.display(), dir = %dir.display(), "watching todo file");
        Ok(WatchGuard::new(watcher))
    }
}

// ---------------------------------------------------------------------------
// Manual watcher
// ---------------------------------------------------------------------------

type Slot = Arc<Mutex<Option<(PathBuf, UnboundedSender<FileEvent>)>>>;

/// A watcher driven by explicit [`ManualWatcher::trigger`] calls.
#[derive(Default, Clone)]
pub struct ManualWatcher {
    slot: Slot,
}

struct ManualRegistration {
    slot: Slot,
}

impl Drop for ManualRegistration {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

impl ManualWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_watching(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Emit a change event for the watched file. Returns `false` when
    /// nothing is registered.
    pub fn trigger(&self) -> bool {
        match &*self.slot.lock() {
            Some((path, tx)) => tx.send(FileEvent { path: path.clone() }).is_ok(),
            None => false,
        }
    }
}

impl FileWatcher for ManualWatcher {
    fn watch(&self, path: &Path, events: UnboundedSender<FileEvent>) -> Result<WatchGuard, SyncError> {
        *self.slot.lock() = Some((path.to_path_buf(), events));
        Ok(WatchGuard::new(ManualRegistration {
            slot: Arc::clone(&self.slot),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn manual_watcher_unregisters_on_drop() {
        let watcher = ManualWatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = watcher.watch(Path::new("/work/TODO.md"), tx).unwrap();

        assert!(watcher.trigger());
        assert_eq!(rx.try_recv().unwrap().path, PathBuf::from("/work/TODO.md"));

        drop(guard);
        assert!(!watcher.is_watching());
        assert!(!watcher.trigger());
    }

    #[test]
    fn relevant_kinds() {
        assert!(is_relevant_event_kind(&EventKind::Create(notify::event::CreateKind::File)));
        assert!(!is_relevant_event_kind(&EventKind::Access(notify::event::AccessKind::Any)));
    }
}
