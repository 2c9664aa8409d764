//! The pluggable filesystem backend interface.
//!
//! Backends implement synchronous operation bodies; the VFS facade wraps
//! each call in a contract so callers always get asynchronous
//! [`FileOperationHandle`](crate::operation::FileOperationHandle)s. A
//! backend also owns two identity concerns:
//!
//! * [`normalize_key`](FileSystemBackend::normalize_key) — the canonical
//!   string for a path, used for handle equality and per-path locking;
//! * [`acquire_write_scope`](FileSystemBackend::acquire_write_scope) — an
//!   optional exclusive write scope (e.g. a cross-process lock). The default
//!   reports [`WriteScopeStatus::NotSupported`], steering the VFS to its
//!   in-process advisory locks.

use std::path::Path;
use std::time::Duration;

use crate::error::VfsResult;
use crate::stream::FileStream;
use crate::types::{
    BatchMetadataOptions, CopyOptions, DirectoryEntry, FileMetadata, LineOperation,
    ListDirectoryOptions, ReadOptions, StreamOptions, WriteOptions,
};

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What a backend supports; callers may branch on this before issuing
/// operations the backend would reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub supports_streaming: bool,
    pub supports_random_access: bool,
    pub supports_directories: bool,
    pub supports_metadata: bool,
    pub supports_atomic_writes: bool,
    pub supports_watching: bool,
    pub is_remote: bool,
    pub max_file_size: u64,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            supports_streaming: true,
            supports_random_access: true,
            supports_directories: true,
            supports_metadata: true,
            supports_atomic_writes: false,
            supports_watching: false,
            is_remote: false,
            max_file_size: u64::MAX,
        }
    }
}

// ---------------------------------------------------------------------------
// Write scopes
// ---------------------------------------------------------------------------

/// Outcome class of a write-scope acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteScopeStatus {
    /// The scope is held; release it by dropping the token.
    Acquired,
    /// Another holder has it; retry after `suggested_backoff`.
    Busy,
    /// The wait exceeded the requested timeout.
    TimedOut,
    /// This backend does not implement write scopes.
    NotSupported,
    /// Acquisition failed outright.
    Error,
}

/// Opaque RAII token: dropping it releases the scope.
pub struct WriteScopeToken {
    _guard: Box<dyn Send>,
}

impl WriteScopeToken {
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for WriteScopeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WriteScopeToken")
    }
}

/// Result of [`FileSystemBackend::acquire_write_scope`]. Carries enough for
/// callers to distinguish contention from errors and pick a backoff.
#[derive(Debug)]
pub struct AcquireWriteScopeResult {
    pub status: WriteScopeStatus,
    pub token: Option<WriteScopeToken>,
    pub error_code: Option<i32>,
    pub message: String,
    pub suggested_backoff: Option<Duration>,
}

impl AcquireWriteScopeResult {
    /// The default "ask the VFS instead" answer.
    pub fn not_supported() -> Self {
        Self {
            status: WriteScopeStatus::NotSupported,
            token: None,
            error_code: None,
            message: String::new(),
            suggested_backoff: None,
        }
    }
}

/// Options for a write-scope acquisition.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireScopeOptions {
    /// `None` uses the backend default.
    pub timeout: Option<Duration>,
    /// `true` = return `Busy` instead of waiting.
    pub non_blocking: bool,
}

/// Outcome of a move: `Partial` means the copy landed but the source could
/// not be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    Partial,
}

/// Output of a read: the bytes plus whether the request was satisfied only
/// partially (short read against an explicit length).
#[derive(Debug, Clone)]
pub struct ReadOutput {
    pub bytes: Vec<u8>,
    pub partial: bool,
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// A mounted filesystem implementation.
///
/// All methods are synchronous; the facade provides the asynchrony. The
/// `WriteOptions` tri-state fields arrive already resolved against the VFS
/// defaults.
pub trait FileSystemBackend: Send + Sync {
    /// Short identifier used in logs ("local", "memory", …).
    fn backend_type(&self) -> &'static str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Canonical identity string for `path`. Must be a pure function of the
    /// input (plus stable filesystem facts); used for handle equality and
    /// per-path lock keys.
    fn normalize_key(&self, path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    fn read_file(&self, path: &Path, options: &ReadOptions) -> VfsResult<ReadOutput>;

    /// Returns the number of bytes written.
    fn write_file(&self, path: &Path, data: &[u8], options: &WriteOptions) -> VfsResult<u64>;

    fn delete_file(&self, path: &Path) -> VfsResult<()>;

    /// Create an empty file (truncating an existing one is an error only if
    /// the backend says so; the local backend leaves existing files alone).
    fn create_file(&self, path: &Path) -> VfsResult<()>;

    fn exists(&self, path: &Path) -> bool;

    fn metadata(&self, path: &Path) -> VfsResult<FileMetadata>;

    /// Metadata for each input path, preserving order; missing paths are
    /// reported with `exists = false` rather than failing the batch.
    fn metadata_batch(&self, options: &BatchMetadataOptions) -> VfsResult<Vec<FileMetadata>>;

    fn create_directory(&self, path: &Path, create_parents: bool) -> VfsResult<()>;

    fn remove_directory(&self, path: &Path, recursive: bool) -> VfsResult<()>;

    fn list_directory(
        &self,
        path: &Path,
        options: &ListDirectoryOptions,
    ) -> VfsResult<Vec<DirectoryEntry>>;

    /// Read line `line_number` (zero-based) with EOL autodetection.
    fn read_line(&self, path: &Path, line_number: usize) -> VfsResult<String>;

    /// Atomically replace line `line_number`, preserving the file's EOL
    /// convention and trailing-newline state. Returns bytes written.
    fn write_line(
        &self,
        path: &Path,
        line_number: usize,
        content: &str,
        options: &WriteOptions,
    ) -> VfsResult<u64>;

    /// Atomically apply a batch of line operations. Returns bytes written.
    fn commit_lines(
        &self,
        path: &Path,
        operations: &[LineOperation],
        options: &WriteOptions,
    ) -> VfsResult<u64>;

    /// Returns the number of bytes copied.
    fn copy_file(&self, source: &Path, destination: &Path, options: &CopyOptions)
        -> VfsResult<u64>;

    fn move_file(
        &self,
        source: &Path,
        destination: &Path,
        overwrite_existing: bool,
    ) -> VfsResult<MoveOutcome>;

    fn open_stream(&self, path: &Path, options: &StreamOptions) -> VfsResult<FileStream>;

    /// Try to take an exclusive write scope for `path`.
    fn acquire_write_scope(
        &self,
        path: &Path,
        options: &AcquireScopeOptions,
    ) -> AcquireWriteScopeResult {
        let _ = (path, options);
        AcquireWriteScopeResult::not_supported()
    }
}
