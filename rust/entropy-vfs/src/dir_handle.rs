//! Value-semantic directory handles.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::FileSystemBackend;
use crate::operation::{FileOpStatus, FileOperationHandle};
use crate::types::ListDirectoryOptions;
use crate::vfs::VirtualFileSystem;

/// Copyable, identity-keyed reference to one directory.
#[derive(Clone)]
pub struct DirectoryHandle {
    vfs: Arc<VirtualFileSystem>,
    backend: Arc<dyn FileSystemBackend>,
    path: PathBuf,
    key: String,
}

impl DirectoryHandle {
    pub(crate) fn new(
        vfs: Arc<VirtualFileSystem>,
        backend: Arc<dyn FileSystemBackend>,
        path: PathBuf,
        key: String,
    ) -> Self {
        Self {
            vfs,
            backend,
            path,
            key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Create the directory.
    ///
    /// Note: the local backend currently always creates missing parents
    /// regardless of `create_parents`; see its `create_directory` docs.
    pub fn create(&self, create_parents: bool) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        self.vfs.submit(move |_payload| {
            backend.create_directory(&path, create_parents)?;
            Ok(FileOpStatus::Complete)
        })
    }

    /// Remove the directory; `recursive` removes contents too.
    pub fn remove(&self, recursive: bool) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        self.vfs.submit(move |_payload| {
            backend.remove_directory(&path, recursive)?;
            Ok(FileOpStatus::Complete)
        })
    }

    /// List entries per `options` (filter → sort → paginate).
    pub fn list(&self, options: ListDirectoryOptions) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        self.vfs.submit(move |payload| {
            payload.entries = Some(backend.list_directory(&path, &options)?);
            Ok(FileOpStatus::Complete)
        })
    }

    /// Fetch this directory's metadata.
    pub fn get_metadata(&self) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        self.vfs.submit(move |payload| {
            payload.metadata = Some(backend.metadata(&path)?);
            Ok(FileOpStatus::Complete)
        })
    }
}

impl PartialEq for DirectoryHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && Arc::ptr_eq(&self.backend, &other.backend)
    }
}

impl Eq for DirectoryHandle {}

impl std::fmt::Debug for DirectoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryHandle")
            .field("path", &self.path)
            .field("key", &self.key)
            .finish()
    }
}
