//! The virtual filesystem facade.
//!
//! A [`VirtualFileSystem`] routes paths to mounted backends (longest-prefix
//! wins, lazily falling back to the local backend), wraps every operation in
//! a contract on its group, and serializes writes per normalized path.
//!
//! # Write serialization
//!
//! [`submit_serialized`](VirtualFileSystem::submit_serialized) first asks the
//! backend for an exclusive write scope. If the backend declines (the local
//! backend's default), the configured [`AdvisoryFallback`] decides between
//! failing fast and taking an in-process per-path mutex, bounded or not.
//! Those mutexes live in an LRU cache keyed by the backend-normalized path;
//! entries are reference-counted, so eviction only drops the cache's
//! reference and can never invalidate a mutex some thread still holds.

use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use entropy_core::{ContractGroup, ExecutionType};
use lru::LruCache;

use crate::backend::{AcquireScopeOptions, FileSystemBackend, WriteScopeStatus};
use crate::dir_handle::DirectoryHandle;
use crate::error::{FileError, FileErrorInfo, VfsResult};
use crate::file_handle::FileHandle;
use crate::local::LocalFileSystemBackend;
use crate::operation::{FileOpStatus, FileOperationHandle, OperationPayload, OperationState};
use crate::types::{AdvisoryFallback, BatchMetadataOptions, VfsConfig, WriteOptions};
use crate::write_batch::WriteBatch;

type PathLock = Arc<parking_lot::Mutex<()>>;

struct LockEntry {
    mutex: PathLock,
    last_access: Instant,
}

/// Concurrent, backend-routing filesystem facade.
pub struct VirtualFileSystem {
    group: Arc<ContractGroup>,
    config: VfsConfig,
    default_backend: RwLock<Option<Arc<dyn FileSystemBackend>>>,
    mounts: RwLock<Vec<(String, Arc<dyn FileSystemBackend>)>>,
    lock_cache: Mutex<LruCache<String, LockEntry>>,
    me: Weak<VirtualFileSystem>,
}

impl VirtualFileSystem {
    /// Create a VFS over `group` with default configuration.
    pub fn new(group: Arc<ContractGroup>) -> Arc<Self> {
        Self::with_config(group, VfsConfig::default())
    }

    /// Create a VFS with explicit configuration.
    pub fn with_config(group: Arc<ContractGroup>, config: VfsConfig) -> Arc<Self> {
        let cache_size = NonZeroUsize::new(config.max_write_locks_cached.max(1)).unwrap();
        Arc::new_cyclic(|me| Self {
            group,
            config,
            default_backend: RwLock::new(None),
            mounts: RwLock::new(Vec::new()),
            lock_cache: Mutex::new(LruCache::new(cache_size)),
            me: me.clone(),
        })
    }

    /// The contract group every operation is scheduled into.
    pub fn group(&self) -> &Arc<ContractGroup> {
        &self.group
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    // -- backend routing ----------------------------------------------------

    /// Mount `backend` at `prefix`. Longest matching prefix wins at lookup.
    pub fn mount_backend(&self, prefix: impl Into<String>, backend: Arc<dyn FileSystemBackend>) {
        let prefix = prefix.into();
        tracing::debug!(%prefix, backend = backend.backend_type(), "mounting backend");
        self.mounts.write().unwrap().push((prefix, backend));
    }

    /// Replace the fallback backend used when no mount matches.
    pub fn set_default_backend(&self, backend: Arc<dyn FileSystemBackend>) {
        *self.default_backend.write().unwrap() = Some(backend);
    }

    /// Backend responsible for `path`: the mount with the longest matching
    /// prefix, else the default backend, lazily created as the local one.
    pub fn find_backend(&self, path: &Path) -> Arc<dyn FileSystemBackend> {
        let path_str = path.to_string_lossy();
        {
            let mounts = self.mounts.read().unwrap();
            let mut best: Option<&(String, Arc<dyn FileSystemBackend>)> = None;
            for mount in mounts.iter() {
                if path_str.starts_with(mount.0.as_str())
                    && best.is_none_or(|b| mount.0.len() > b.0.len())
                {
                    best = Some(mount);
                }
            }
            if let Some((_, backend)) = best {
                return Arc::clone(backend);
            }
        }

        if let Some(backend) = self.default_backend.read().unwrap().as_ref() {
            return Arc::clone(backend);
        }

        let mut default = self.default_backend.write().unwrap();
        Arc::clone(default.get_or_insert_with(|| {
            tracing::debug!("installing lazy local backend as default");
            Arc::new(LocalFileSystemBackend::new())
        }))
    }

    // -- handle construction ------------------------------------------------

    /// Value-semantic handle to a file, keyed by the backend's normalized
    /// identity for `path`.
    pub fn create_file_handle(self: &Arc<Self>, path: impl AsRef<Path>) -> FileHandle {
        let path = path.as_ref();
        let backend = self.find_backend(path);
        let key = backend.normalize_key(path);
        FileHandle::new(Arc::clone(self), backend, path.to_path_buf(), key)
    }

    /// Value-semantic handle to a directory.
    pub fn create_directory_handle(self: &Arc<Self>, path: impl AsRef<Path>) -> DirectoryHandle {
        let path = path.as_ref();
        let backend = self.find_backend(path);
        let key = backend.normalize_key(path);
        DirectoryHandle::new(Arc::clone(self), backend, path.to_path_buf(), key)
    }

    /// Builder collecting line edits for one atomic commit.
    pub fn create_write_batch(self: &Arc<Self>, path: impl AsRef<Path>) -> WriteBatch {
        let path = path.as_ref();
        let backend = self.find_backend(path);
        WriteBatch::new(Arc::clone(self), backend, path.to_path_buf())
    }

    /// Batch metadata query routed through the backend for each path's
    /// mount. All paths in one call share the first path's backend.
    pub fn get_metadata_batch(self: &Arc<Self>, paths: Vec<PathBuf>) -> FileOperationHandle {
        let backend = match paths.first() {
            Some(first) => self.find_backend(first),
            None => self.find_backend(Path::new("")),
        };
        self.submit(move |payload| {
            let batch = backend.metadata_batch(&BatchMetadataOptions { paths })?;
            payload.metadata_batch = Some(batch);
            Ok(FileOpStatus::Complete)
        })
    }

    // -- operation submission -----------------------------------------------

    /// Resolve tri-state write options against the VFS defaults.
    pub(crate) fn resolve_write_options(&self, mut options: WriteOptions) -> WriteOptions {
        if options.create_parent_dirs.is_none() {
            options.create_parent_dirs = Some(self.config.default_create_parent_dirs);
        }
        if options.use_lock_file.is_none() {
            options.use_lock_file = Some(self.config.default_use_lock_file);
        }
        if options.lock_timeout.is_none() {
            options.lock_timeout = Some(self.config.lock_acquire_timeout);
        }
        if options.lock_suffix.is_none() {
            options.lock_suffix = Some(self.config.lock_suffix.clone());
        }
        options
    }

    /// Schedule `body` as an any-thread contract and return its handle.
    ///
    /// The operation's progress thunk opportunistically executes one ready
    /// contract from the group, so a worker that waits on an operation it
    /// issued keeps the pool draining instead of deadlocking.
    pub(crate) fn submit<F>(&self, body: F) -> FileOperationHandle
    where
        F: FnOnce(&mut OperationPayload) -> VfsResult<FileOpStatus> + Send + 'static,
    {
        let state = OperationState::new();

        let group_weak = Arc::downgrade(&self.group);
        state.set_progress(Arc::new(move || {
            if let Some(group) = group_weak.upgrade() {
                let mut bias = 0u64;
                let ready = group.select_for_execution(&mut bias);
                if ready.valid() {
                    group.execute_contract(&ready);
                }
            }
        }));

        let shared = Arc::clone(&state);
        let contract = self.group.create_contract(
            Box::new(move || {
                shared.set_running();
                let mut payload = OperationPayload::default();
                let outcome = catch_unwind(AssertUnwindSafe(|| body(&mut payload)));
                match outcome {
                    Ok(Ok(status)) => shared.finish(status, payload),
                    Ok(Err(error)) => shared.finish_failed(error, payload),
                    Err(panic) => shared.finish_failed(
                        FileErrorInfo::new(
                            FileError::Unknown,
                            format!("unhandled panic: {}", panic_message(panic.as_ref())),
                            None,
                        ),
                        payload,
                    ),
                }
            }),
            ExecutionType::AnyThread,
        );

        if !contract.valid() {
            return FileOperationHandle::failed(FileErrorInfo::new(
                FileError::IoError,
                "work contract group is at capacity",
                None,
            ));
        }
        contract.schedule();
        FileOperationHandle::new(state)
    }

    /// Like [`submit`](Self::submit), but `body` runs under an exclusive
    /// write scope for `path` (when per-path serialization is enabled).
    pub(crate) fn submit_serialized<F>(&self, path: &Path, body: F) -> FileOperationHandle
    where
        F: FnOnce(&mut OperationPayload) -> VfsResult<FileOpStatus> + Send + 'static,
    {
        let backend = self.find_backend(path);
        let config = self.config.clone();
        let vfs = self.me.clone();
        let path = path.to_path_buf();

        self.submit(move |payload| {
            if !config.serialize_writes_per_path {
                return body(payload);
            }

            let scope = backend.acquire_write_scope(
                &path,
                &AcquireScopeOptions {
                    timeout: Some(config.advisory_acquire_timeout),
                    non_blocking: false,
                },
            );

            match scope.status {
                WriteScopeStatus::Acquired => {
                    if let Some(token) = scope.token {
                        let result = body(payload);
                        drop(token);
                        return result;
                    }
                    // Acquired-with-no-token violates the scope contract.
                    if config.advisory_fallback == AdvisoryFallback::None {
                        return Err(FileErrorInfo::new(
                            FileError::IoError,
                            "backend granted write scope without a token",
                            Some(&path),
                        ));
                    }
                }
                WriteScopeStatus::NotSupported => {}
                WriteScopeStatus::Busy => {
                    if config.advisory_fallback == AdvisoryFallback::None {
                        return Err(FileErrorInfo::new(
                            FileError::Conflict,
                            format!("write scope busy: {}", scope.message),
                            Some(&path),
                        ));
                    }
                }
                WriteScopeStatus::TimedOut => {
                    if config.advisory_fallback == AdvisoryFallback::None {
                        return Err(FileErrorInfo::new(
                            FileError::Timeout,
                            "timed out acquiring backend write scope",
                            Some(&path),
                        ));
                    }
                }
                WriteScopeStatus::Error => {
                    if config.advisory_fallback == AdvisoryFallback::None {
                        let mut info = FileErrorInfo::new(
                            FileError::IoError,
                            format!("write scope error: {}", scope.message),
                            Some(&path),
                        );
                        info.system_error = scope.error_code;
                        return Err(info);
                    }
                }
            }

            // In-process advisory lock path.
            let Some(vfs) = vfs.upgrade() else {
                return Err(FileErrorInfo::new(
                    FileError::IoError,
                    "filesystem has shut down",
                    Some(&path),
                ));
            };
            let (key, lock) = vfs.lock_for_path(backend.as_ref(), &path);

            match config.advisory_fallback {
                AdvisoryFallback::None => Err(FileErrorInfo::new(
                    FileError::Conflict,
                    "write scope unavailable and advisory fallback disabled",
                    Some(&path),
                )),
                AdvisoryFallback::FallbackWithTimeout => {
                    match lock.try_lock_for(config.advisory_acquire_timeout) {
                        Some(guard) => {
                            let result = body(payload);
                            drop(guard);
                            result
                        }
                        None => Err(FileErrorInfo::new(
                            FileError::Timeout,
                            format!("timed out acquiring write lock for `{}`", key),
                            Some(&path),
                        )),
                    }
                }
                AdvisoryFallback::FallbackThenWait => {
                    let guard = lock.lock();
                    let result = body(payload);
                    drop(guard);
                    result
                }
            }
        })
    }

    // -- per-path lock cache ------------------------------------------------

    /// Fetch (or create) the write lock for `path`, refreshing its LRU slot.
    ///
    /// Eviction prefers entries idle longer than `write_lock_timeout` and
    /// falls back to the LRU tail when the cache is still full. Holders keep
    /// their `Arc`, so an evicted mutex stays alive until released.
    fn lock_for_path(&self, backend: &dyn FileSystemBackend, path: &Path) -> (String, PathLock) {
        let key = backend.normalize_key(path);
        let now = Instant::now();
        let mut cache = self.lock_cache.lock().unwrap();

        if let Some(entry) = cache.get_mut(&key) {
            entry.last_access = now;
            return (key, Arc::clone(&entry.mutex));
        }

        if cache.len() == cache.cap().get() {
            while let Some((_, entry)) = cache.peek_lru() {
                if now.duration_since(entry.last_access) > self.config.write_lock_timeout {
                    cache.pop_lru();
                } else {
                    break;
                }
            }
            if cache.len() == cache.cap().get() {
                cache.pop_lru();
            }
        }

        let mutex: PathLock = Arc::new(parking_lot::Mutex::new(()));
        cache.put(
            key.clone(),
            LockEntry {
                mutex: Arc::clone(&mutex),
                last_access: now,
            },
        );
        (key, mutex)
    }

    /// Number of per-path locks currently cached.
    pub fn cached_write_lock_count(&self) -> usize {
        self.lock_cache.lock().unwrap().len()
    }
}

impl std::fmt::Debug for VirtualFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFileSystem")
            .field("mounts", &self.mounts.read().unwrap().len())
            .field("cached_write_locks", &self.cached_write_lock_count())
            .finish()
    }
}

/// Best-effort extraction of a panic payload message.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
