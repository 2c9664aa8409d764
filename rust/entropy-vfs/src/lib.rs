//! EntropyVFS — a concurrent virtual filesystem over the work execution
//! core.
//!
//! Every operation issued through a [`VirtualFileSystem`] is scheduled as a
//! contract in an `entropy-core` group and reported through a
//! [`FileOperationHandle`]. Paths route to pluggable
//! [`FileSystemBackend`]s by longest-prefix mount; writes to a single path
//! are serialized; line-level edits and [`WriteBatch`] commits replace files
//! atomically via a temp-file-plus-rename in the destination directory.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use entropy_core::{ContractGroup, WorkService, WorkServiceConfig};
//! use entropy_vfs::{FileOpStatus, VirtualFileSystem};
//!
//! let group = ContractGroup::new(64, "vfs");
//! let service = Arc::new(WorkService::new(WorkServiceConfig::default()));
//! service.add_group(&group).unwrap();
//! service.start().unwrap();
//!
//! let vfs = VirtualFileSystem::new(Arc::clone(&group));
//! let file = vfs.create_file_handle("/tmp/hello.txt");
//! assert_eq!(file.write_all("hello\n").wait(), FileOpStatus::Complete);
//!
//! let read = file.read_all();
//! read.wait();
//! assert_eq!(read.contents_text(), "hello\n");
//! service.stop();
//! ```
#![warn(clippy::all)]

pub mod backend;
pub mod dir_handle;
pub mod error;
pub mod file_handle;
pub mod local;
pub mod operation;
pub mod stream;
pub mod types;
pub mod vfs;
pub mod watch;
pub mod write_batch;

pub use backend::{
    AcquireScopeOptions, AcquireWriteScopeResult, BackendCapabilities, FileSystemBackend,
    MoveOutcome, ReadOutput, WriteScopeStatus, WriteScopeToken,
};
pub use dir_handle::DirectoryHandle;
pub use error::{FileError, FileErrorInfo, VfsResult};
pub use file_handle::FileHandle;
pub use local::LocalFileSystemBackend;
pub use operation::{FileOpStatus, FileOperationHandle};
pub use stream::{FileStream, SeekDir};
pub use types::{
    AdvisoryFallback, BatchMetadataOptions, CopyOptions, DirectoryEntry, Eol, FileMetadata,
    LineOperation, ListDirectoryOptions, ReadOptions, SortOrder, StreamMode, StreamOptions,
    VfsConfig, WriteOptions,
};
pub use vfs::VirtualFileSystem;
pub use watch::{FileWatchEvent, FileWatchManager, WatchId};
pub use write_batch::WriteBatch;
