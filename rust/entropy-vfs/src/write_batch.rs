//! Builder for atomic multi-line edits.
//!
//! A [`WriteBatch`] collects deferred line operations against one file and
//! commits them in a single atomic replace through the VFS's serialized
//! write path. Operations are immutable once enqueued; the application
//! order at commit is fixed (see
//! [`apply_line_operations`](crate::types::apply_line_operations)) and does
//! not depend on enqueue order across kinds.
//!
//! Committing is **not** idempotent: committing the same batch twice applies
//! its operations twice. Use [`reset`](WriteBatch::reset) between logical
//! edits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::FileSystemBackend;
use crate::error::VfsResult;
use crate::operation::{FileOpStatus, FileOperationHandle};
use crate::types::{
    apply_line_operations, detect_eol, has_trailing_newline, join_lines, split_lines,
    LineOperation, ReadOptions, WriteOptions,
};
use crate::vfs::VirtualFileSystem;

/// Collects line edits for one file and commits them atomically.
pub struct WriteBatch {
    vfs: Arc<VirtualFileSystem>,
    backend: Arc<dyn FileSystemBackend>,
    path: PathBuf,
    operations: Vec<LineOperation>,
}

impl WriteBatch {
    pub(crate) fn new(
        vfs: Arc<VirtualFileSystem>,
        backend: Arc<dyn FileSystemBackend>,
        path: PathBuf,
    ) -> Self {
        Self {
            vfs,
            backend,
            path,
            operations: Vec::new(),
        }
    }

    // -- builders -----------------------------------------------------------

    /// Assign `content` to line `line`, extending the file if needed.
    pub fn write_line(&mut self, line: usize, content: impl Into<String>) -> &mut Self {
        self.operations.push(LineOperation::Write {
            line,
            content: content.into(),
        });
        self
    }

    /// Insert `content` before line `line`.
    pub fn insert_line(&mut self, line: usize, content: impl Into<String>) -> &mut Self {
        self.operations.push(LineOperation::Insert {
            line,
            content: content.into(),
        });
        self
    }

    /// Insert a contiguous block of lines before `line`.
    ///
    /// Enqueued as same-index inserts in reverse so the commit-time ordering
    /// (inserts applied highest-first, stable among equals) lands the block
    /// in the given order.
    pub fn insert_lines(
        &mut self,
        line: usize,
        contents: impl IntoIterator<Item = impl Into<String>>,
    ) -> &mut Self {
        let block: Vec<String> = contents.into_iter().map(Into::into).collect();
        for content in block.into_iter().rev() {
            self.operations.push(LineOperation::Insert { line, content });
        }
        self
    }

    /// Delete line `line`.
    pub fn delete_line(&mut self, line: usize) -> &mut Self {
        self.operations.push(LineOperation::Delete { line });
        self
    }

    /// Delete `count` lines starting at `start`.
    pub fn delete_range(&mut self, start: usize, count: usize) -> &mut Self {
        for line in start..start + count {
            self.operations.push(LineOperation::Delete { line });
        }
        self
    }

    /// Append `content` as a new final line.
    pub fn append_line(&mut self, content: impl Into<String>) -> &mut Self {
        self.operations.push(LineOperation::Append {
            content: content.into(),
        });
        self
    }

    /// Replace the whole file with `content`.
    pub fn replace_all(&mut self, content: impl Into<String>) -> &mut Self {
        self.operations.push(LineOperation::ReplaceAll {
            content: content.into(),
        });
        self
    }

    /// Remove every line.
    pub fn clear(&mut self) -> &mut Self {
        self.operations.push(LineOperation::Clear);
        self
    }

    // -- queries ------------------------------------------------------------

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    /// Number of operations queued.
    pub fn pending_operations(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// The queued operations (for inspection or serialization).
    pub fn operations(&self) -> &[LineOperation] {
        &self.operations
    }

    /// Drop every queued operation.
    pub fn reset(&mut self) {
        self.operations.clear();
    }

    // -- commit / preview ---------------------------------------------------

    /// Commit the queued operations atomically with default options.
    pub fn commit(&self) -> FileOperationHandle {
        self.commit_with(WriteOptions::default())
    }

    /// Commit with explicit overrides (`ensure_final_newline`,
    /// `create_parent_dirs`, `fsync`).
    pub fn commit_with(&self, options: WriteOptions) -> FileOperationHandle {
        let backend = Arc::clone(&self.backend);
        let path = self.path.clone();
        let operations = self.operations.clone();
        let options = self.vfs.resolve_write_options(options);
        self.vfs.submit_serialized(&self.path, move |payload| {
            payload.wrote = backend.commit_lines(&path, &operations, &options)?;
            Ok(FileOpStatus::Complete)
        })
    }

    /// Project the content a commit would produce, without writing.
    pub fn preview(&self) -> VfsResult<String> {
        let (mut lines, eol, trailing, existed) = match self
            .backend
            .read_file(&self.path, &ReadOptions::default())
        {
            Ok(output) => {
                let eol = detect_eol(&output.bytes);
                let trailing = has_trailing_newline(&output.bytes);
                (split_lines(&output.bytes), eol, trailing, true)
            }
            Err(e) if e.code == crate::error::FileError::FileNotFound => {
                (Vec::new(), crate::types::Eol::platform(), true, false)
            }
            Err(e) => return Err(e),
        };

        apply_line_operations(&mut lines, &self.operations);
        let trailing = trailing || !existed;
        let bytes = join_lines(&lines, eol, trailing);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl std::fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatch")
            .field("path", &self.path)
            .field("pending_operations", &self.operations.len())
            .finish()
    }
}
