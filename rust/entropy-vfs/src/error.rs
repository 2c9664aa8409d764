//! The VFS error surface.
//!
//! Every failing operation produces a [`FileErrorInfo`]: a stable
//! [`FileError`] code, a human-readable message, the path involved, and the
//! raw OS error when one exists. Messages are informational only — callers
//! (and tests) branch on the code.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error taxonomy for file operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileError {
    /// No error (used by freshly initialized state).
    None,
    /// Path does not exist where it was required to.
    FileNotFound,
    /// Permission denied.
    AccessDenied,
    /// No space left on device (or quota exhausted).
    DiskFull,
    /// Malformed path, special file, or structural misuse.
    InvalidPath,
    /// Other local I/O failure.
    IoError,
    /// Remote/transport failure.
    NetworkError,
    /// Operation or lock acquisition timed out.
    Timeout,
    /// Contention detected (e.g. destination exists, scope busy).
    Conflict,
    /// Anything else, including caught panics.
    Unknown,
}

/// Full error report attached to a failed operation.
#[derive(Debug, Clone, Error)]
pub struct FileErrorInfo {
    pub code: FileError,
    pub message: String,
    pub path: Option<PathBuf>,
    /// Raw OS error code when the failure came from a syscall.
    pub system_error: Option<i32>,
}

impl std::fmt::Display for FileErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)?;
        if let Some(path) = &self.path {
            write!(f, " ({})", path.display())?;
        }
        if let Some(os) = self.system_error {
            write!(f, " [os error {}]", os)?;
        }
        Ok(())
    }
}

impl FileErrorInfo {
    pub fn new(code: FileError, message: impl Into<String>, path: Option<&Path>) -> Self {
        Self {
            code,
            message: message.into(),
            path: path.map(Path::to_path_buf),
            system_error: None,
        }
    }

    /// Classify an `io::Error` per the backend mapping table.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        Self {
            code: classify_io_error(&err),
            message: err.to_string(),
            path: Some(path.to_path_buf()),
            system_error: err.raw_os_error(),
        }
    }

    /// Like [`from_io`](Self::from_io) with extra context prepended to the
    /// message.
    pub fn from_io_context(err: io::Error, path: &Path, context: &str) -> Self {
        Self {
            code: classify_io_error(&err),
            message: format!("{}: {}", context, err),
            path: Some(path.to_path_buf()),
            system_error: err.raw_os_error(),
        }
    }
}

/// Map `io::ErrorKind` onto the stable taxonomy.
fn classify_io_error(err: &io::Error) -> FileError {
    use io::ErrorKind::*;
    match err.kind() {
        NotFound => FileError::FileNotFound,
        PermissionDenied => FileError::AccessDenied,
        StorageFull | QuotaExceeded => FileError::DiskFull,
        InvalidInput | InvalidFilename | IsADirectory | NotADirectory => FileError::InvalidPath,
        TimedOut => FileError::Timeout,
        AlreadyExists => FileError::Conflict,
        NetworkDown | NetworkUnreachable | HostUnreachable | ConnectionRefused
        | ConnectionReset | ConnectionAborted | NotConnected => FileError::NetworkError,
        _ => FileError::IoError,
    }
}

/// Result alias used throughout the VFS.
pub type VfsResult<T> = Result<T, FileErrorInfo>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
