//! Value-semantic file handles.
//!
//! A [`FileHandle`] is a dumb, copyable reference: `(vfs, backend, path,
//! normalized key)`. It never probes the filesystem itself — every operation
//! is forwarded through the facade, which schedules it as a contract and
//! returns a [`FileOperationHandle`]. Two handles are equal when they refer
//! to the same backend and the same normalized identity key, regardless of
//! how the path was spelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::FileSystemBackend;
use crate::error::VfsResult;
use crate::operation::{FileOpStatus, FileOperationHandle};
use crate::stream::FileStream;
use crate::types::{ReadOptions, StreamMode, StreamOptions, WriteOptions};
use crate::vfs::VirtualFileSystem;

/// Copyable, identity-keyed reference to one file.
#[derive(Clone)]
pub struct FileHandle {
    vfs: Arc<VirtualFileSystem>,
    backend: Arc<dyn FileSystemBackend>,
    path: PathBuf,
    key: String,
}

impl FileHandle {
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

    /// The path this handle was created with (not normalized).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backend-normalized identity key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cheap existence probe (synchronous; does not schedule a contract).
    pub fn exists(&self) -> bool {
        self.backend.exists(&self.path)
    }

    // -- reads --------------------------------------------------------------

    /// Read the whole file.
    pub fn read_all(&self) -> FileOperationHandle {
        self.read_with(ReadOptions::default())
    }

    /// Read `length` bytes starting at `offset`. Completes `Partial` when
    /// fewer bytes were available.
    pub fn read_range(&self, offset: u64, length: usize) -> FileOperationHandle {
        self.read_with(ReadOptions::range(offset, length))
    }

    fn read_with(&self, options: ReadOptions) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        self.vfs.submit(move |payload| {
            let output = backend.read_file(&path, &options)?;
            let partial = output.partial;
            payload.bytes = Some(output.bytes);
            Ok(if partial {
                FileOpStatus::Partial
            } else {
                FileOpStatus::Complete
            })
        })
    }

    /// Read line `line_number` (zero-based).
    pub fn read_line(&self, line_number: usize) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        self.vfs.submit(move |payload| {
            payload.text = Some(backend.read_line(&path, line_number)?);
            Ok(FileOpStatus::Complete)
        })
    }

    /// Fetch this file's metadata.
    pub fn get_metadata(&self) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        self.vfs.submit(move |payload| {
            payload.metadata = Some(backend.metadata(&path)?);
            Ok(FileOpStatus::Complete)
        })
    }

    // -- writes -------------------------------------------------------------

    /// Replace the whole file with `data` (text or bytes).
    pub fn write_all(&self, data: impl Into<Vec<u8>>) -> FileOperationHandle {
        self.write_all_with(data, WriteOptions::default())
    }

    /// Replace the whole file with explicit options.
    pub fn write_all_with(
        &self,
        data: impl Into<Vec<u8>>,
        options: WriteOptions,
    ) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        let data = data.into();
        let options = self.vfs.resolve_write_options(options);
        self.vfs.submit_serialized(&self.path, move |payload| {
            payload.wrote = backend.write_file(&path, &data, &options)?;
            Ok(FileOpStatus::Complete)
        })
    }

    /// Write `data` at `offset` without truncating the rest of the file.
    pub fn write_range(&self, offset: u64, data: impl Into<Vec<u8>>) -> FileOperationHandle {
        self.write_all_with(data, WriteOptions::at_offset(offset))
    }

    /// Atomically replace line `line_number`, preserving the file's EOL
    /// convention and trailing-newline state.
    pub fn write_line(&self, line_number: usize, content: impl Into<String>) -> FileOperationHandle {
        self.write_line_with(line_number, content, WriteOptions::default())
    }

    /// [`write_line`](Self::write_line) with explicit options.
    pub fn write_line_with(
        &self,
        line_number: usize,
        content: impl Into<String>,
        options: WriteOptions,
    ) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        let content = content.into();
        let options = self.vfs.resolve_write_options(options);
        self.vfs.submit_serialized(&self.path, move |payload| {
            payload.wrote = backend.write_line(&path, line_number, &content, &options)?;
            Ok(FileOpStatus::Complete)
        })
    }

    /// Create the file empty (existing content is left untouched).
    pub fn create_empty(&self) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        self.vfs.submit_serialized(&self.path, move |_payload| {
            backend.create_file(&path)?;
            Ok(FileOpStatus::Complete)
        })
    }

    /// Delete the file.
    pub fn remove(&self) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        self.vfs.submit_serialized(&self.path, move |_payload| {
            backend.delete_file(&path)?;
            Ok(FileOpStatus::Complete)
        })
    }

    // -- copy / move --------------------------------------------------------

    /// Copy this file to `destination`.
    pub fn copy_to(
        &self,
        destination: impl AsRef<Path>,
        options: crate::types::CopyOptions,
    ) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let source = self.path.clone();
        let destination = destination.as_ref().to_path_buf();
        let mut options = options;
        if options.create_parent_dirs.is_none() {
            options.create_parent_dirs = Some(self.vfs.config().default_create_parent_dirs);
        }
        self.vfs.submit_serialized(&destination.clone(), move |payload| {
            payload.wrote = backend.copy_file(&source, &destination, &options)?;
            Ok(FileOpStatus::Complete)
        })
    }

    /// Move this file to `destination`; falls back to copy + delete across
    /// devices. Completes `Partial` when the source could not be removed
    /// after a successful copy.
    pub fn move_to(
        &self,
        destination: impl AsRef<Path>,
        overwrite_existing: bool,
    ) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let source = self.path.clone();
        let destination = destination.as_ref().to_path_buf();
        self.vfs.submit_serialized(&destination.clone(), move |_payload| {
            match backend.move_file(&source, &destination, overwrite_existing)? {
                crate::backend::MoveOutcome::Moved => Ok(FileOpStatus::Complete),
                crate::backend::MoveOutcome::Partial => Ok(FileOpStatus::Partial),
            }
        })
    }

    // -- streams ------------------------------------------------------------

    /// Open a sequential read stream.
    pub fn open_read_stream(&self) -> VfsResult<FileStream> {
        self.backend.open_stream(&self.path, &StreamOptions::default())
    }

    /// Open a write stream, optionally appending.
    pub fn open_write_stream(&self, append: bool) -> VfsResult<FileStream> {
        self.backend.open_stream(
            &self.path,
            &StreamOptions {
                mode: StreamMode::Write,
                append,
                ..Default::default()
            },
        )
    }

    /// Open a combined read/write stream.
    pub fn open_read_write_stream(&self) -> VfsResult<FileStream> {
        self.backend.open_stream(
            &self.path,
            &StreamOptions {
                mode: StreamMode::ReadWrite,
                ..Default::default()
            },
        )
    }

    /// Open a buffered read stream with an explicit buffer size.
    pub fn open_buffered_stream(&self, buffer_size: usize) -> VfsResult<FileStream> {
        self.backend.open_stream(
            &self.path,
            &StreamOptions {
                mode: StreamMode::Read,
                buffered: true,
                buffer_size,
                ..Default::default()
            },
        )
    }
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && Arc::ptr_eq(&self.backend, &other.backend)
    }
}

impl Eq for FileHandle {}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("key", &self.key)
            .field("backend", &self.backend.backend_type())
            .finish()
    }
}
