//! Polling file watcher.
//!
//! The watch manager keeps a metadata snapshot per registered path and
//! compares against it on each poll, reporting created / modified / removed
//! transitions to the registered callback. Polling is driven either manually
//! via [`poll_now`](FileWatchManager::poll_now) or by a repeating timer from
//! the core timer service — no OS notification APIs are involved, which
//! keeps the behavior identical across backends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use entropy_core::{CoreError, ExecutionType, Timer, TimerService};

use crate::backend::FileSystemBackend;

/// Identifier for one registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// A change observed on a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileWatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

pub type WatchCallback = Arc<dyn Fn(&FileWatchEvent) + Send + Sync>;

/// `(size, mtime)` fingerprint; `None` = path absent.
type Snapshot = Option<(u64, Option<i64>)>;

struct WatchEntry {
    path: PathBuf,
    callback: WatchCallback,
    snapshot: Snapshot,
}

/// Snapshot-comparing watcher over one backend.
pub struct FileWatchManager {
    backend: Arc<dyn FileSystemBackend>,
    watches: Mutex<HashMap<u64, WatchEntry>>,
    next_id: AtomicU64,
    timer: Mutex<Option<Timer>>,
}

impl FileWatchManager {
    pub fn new(backend: Arc<dyn FileSystemBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            watches: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timer: Mutex::new(None),
        })
    }

    /// Register `path`; `callback` fires on every observed transition.
    /// The current state becomes the baseline (no event for it).
    pub fn watch(&self, path: impl AsRef<Path>, callback: WatchCallback) -> WatchId {
        let path = path.as_ref().to_path_buf();
        let snapshot = self.fingerprint(&path);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watches.lock().unwrap().insert(
            id,
            WatchEntry {
                path,
                callback,
                snapshot,
            },
        );
        WatchId(id)
    }

    /// Remove a watch; unknown ids are ignored (idempotent).
    pub fn unwatch(&self, id: WatchId) {
        self.watches.lock().unwrap().remove(&id.0);
    }

    /// Number of active watches.
    pub fn watch_count(&self) -> usize {
        self.watches.lock().unwrap().len()
    }

    /// Compare every watch against its snapshot, firing callbacks for
    /// transitions. Returns the number of events delivered.
    pub fn poll_now(&self) -> usize {
        let mut pending: Vec<(WatchCallback, FileWatchEvent)> = Vec::new();
        {
            let mut watches = self.watches.lock().unwrap();
            for entry in watches.values_mut() {
                let current = self.fingerprint(&entry.path);
                let event = match (&entry.snapshot, &current) {
                    (None, Some(_)) => Some(FileWatchEvent::Created(entry.path.clone())),
                    (Some(_), None) => Some(FileWatchEvent::Removed(entry.path.clone())),
                    (Some(before), Some(after)) if before != after => {
                        Some(FileWatchEvent::Modified(entry.path.clone()))
                    }
                    _ => None,
                };
                if let Some(event) = event {
                    pending.push((Arc::clone(&entry.callback), event));
                    entry.snapshot = current;
                }
            }
        }
        // Callbacks run without the watch lock so they may re-register.
        for (callback, event) in &pending {
            callback(event);
        }
        pending.len()
    }

    /// Drive polling from a repeating timer on the core timer service.
    pub fn start_polling(
        self: &Arc<Self>,
        timers: &Arc<TimerService>,
        interval: Duration,
    ) -> Result<(), CoreError> {
        let weak: Weak<FileWatchManager> = Arc::downgrade(self);
        let timer = timers.schedule_timer(
            interval,
            move || {
                if let Some(manager) = weak.upgrade() {
                    manager.poll_now();
                }
            },
            true,
            ExecutionType::AnyThread,
        )?;
        *self.timer.lock().unwrap() = Some(timer);
        Ok(())
    }

    /// Cancel the polling timer, if any. Watches stay registered.
    pub fn stop_polling(&self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.invalidate();
        }
    }

    fn fingerprint(&self, path: &Path) -> Snapshot {
        match self.backend.metadata(path) {
            Ok(meta) if meta.exists => Some((meta.size, meta.last_modified_ms)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for FileWatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatchManager")
            .field("watches", &self.watch_count())
            .field("polling", &self.timer.lock().unwrap().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalFileSystemBackend;
    use std::fs;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("entropy_watch_test_{name}_{}", std::process::id()));
        if dir.exists() {
            fs::remove_dir_all(&dir).ok();
        }
        fs::create_dir_all(&dir).expect("create tmp dir");
        dir
    }

    fn collector() -> (WatchCallback, Arc<Mutex<Vec<FileWatchEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: WatchCallback = Arc::new(move |event: &FileWatchEvent| {
            sink.lock().unwrap().push(event.clone());
        });
        (callback, events)
    }

    #[test]
    fn creation_is_reported() {
        let dir = tmp_dir("create");
        let path = dir.join("appears.txt");
        let manager = FileWatchManager::new(Arc::new(LocalFileSystemBackend::new()));
        let (callback, events) = collector();
        manager.watch(&path, callback);

        assert_eq!(manager.poll_now(), 0);
        fs::write(&path, "now").unwrap();
        assert_eq!(manager.poll_now(), 1);
        assert_eq!(
            events.lock().unwrap()[0],
            FileWatchEvent::Created(path.clone())
        );
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn modification_and_removal_are_reported() {
        let dir = tmp_dir("modify");
        let path = dir.join("changes.txt");
        fs::write(&path, "v1").unwrap();

        let manager = FileWatchManager::new(Arc::new(LocalFileSystemBackend::new()));
        let (callback, events) = collector();
        manager.watch(&path, callback);

        fs::write(&path, "longer content v2").unwrap();
        assert_eq!(manager.poll_now(), 1);
        fs::remove_file(&path).unwrap();
        assert_eq!(manager.poll_now(), 1);

        let events = events.lock().unwrap();
        assert!(matches!(events[0], FileWatchEvent::Modified(_)));
        assert!(matches!(events[1], FileWatchEvent::Removed(_)));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unwatch_is_idempotent() {
        let dir = tmp_dir("unwatch");
        let manager = FileWatchManager::new(Arc::new(LocalFileSystemBackend::new()));
        let (callback, _events) = collector();
        let id = manager.watch(dir.join("f"), callback);
        assert_eq!(manager.watch_count(), 1);

        manager.unwatch(id);
        manager.unwatch(id);
        assert_eq!(manager.watch_count(), 0);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn no_event_without_changes() {
        let dir = tmp_dir("steady");
        let path = dir.join("still.txt");
        fs::write(&path, "same").unwrap();

        let manager = FileWatchManager::new(Arc::new(LocalFileSystemBackend::new()));
        let (callback, events) = collector();
        manager.watch(&path, callback);

        assert_eq!(manager.poll_now(), 0);
        assert_eq!(manager.poll_now(), 0);
        assert!(events.lock().unwrap().is_empty());
        fs::remove_dir_all(&dir).ok();
    }
}
