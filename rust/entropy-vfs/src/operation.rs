//! Shared state between an operation's issuer and the worker running it.
//!
//! Every VFS call returns a [`FileOperationHandle`] immediately; the actual
//! work happens later inside a contract. The handle wraps a shared state
//! block: an atomic status, a payload mutex for results, and a condvar for
//! completion. [`wait`](FileOperationHandle::wait) cooperatively runs an
//! optional *progress* thunk between condvar waits — when the waiter is
//! itself a worker that issued the operation, the thunk lets it execute
//! ready contracts instead of deadlocking on its own pool.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{FileError, FileErrorInfo};
use crate::types::{DirectoryEntry, FileMetadata};

/// How often `wait` wakes to run the progress thunk.
const WAIT_POLL: Duration = Duration::from_millis(1);

/// Status of an asynchronous file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileOpStatus {
    /// Scheduled but not started.
    Pending = 0,
    /// A worker is running it.
    Running = 1,
    /// Completed, but with less data than requested (e.g. short read).
    Partial = 2,
    /// Completed successfully.
    Complete = 3,
    /// Failed; see [`FileOperationHandle::error_info`].
    Failed = 4,
}

impl FileOpStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FileOpStatus::Running,
            2 => FileOpStatus::Partial,
            3 => FileOpStatus::Complete,
            4 => FileOpStatus::Failed,
            _ => FileOpStatus::Pending,
        }
    }

    /// `true` once the operation can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileOpStatus::Partial | FileOpStatus::Complete | FileOpStatus::Failed
        )
    }
}

/// Result payload filled in by the worker.
#[derive(Default)]
pub(crate) struct OperationPayload {
    pub bytes: Option<Vec<u8>>,
    pub text: Option<String>,
    pub wrote: u64,
    pub metadata: Option<FileMetadata>,
    pub entries: Option<Vec<DirectoryEntry>>,
    pub metadata_batch: Option<Vec<FileMetadata>>,
    pub error: Option<FileErrorInfo>,
}

pub(crate) type ProgressThunk = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct OperationState {
    status: AtomicU8,
    payload: Mutex<OperationPayload>,
    done_lock: Mutex<bool>,
    done_cv: Condvar,
    progress: Mutex<Option<ProgressThunk>>,
}

impl OperationState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU8::new(FileOpStatus::Pending as u8),
            payload: Mutex::new(OperationPayload::default()),
            done_lock: Mutex::new(false),
            done_cv: Condvar::new(),
            progress: Mutex::new(None),
        })
    }

    pub(crate) fn status(&self) -> FileOpStatus {
        FileOpStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_progress(&self, thunk: ProgressThunk) {
        *self.progress.lock().unwrap() = Some(thunk);
    }

    pub(crate) fn set_running(&self) {
        let _ = self.status.compare_exchange(
            FileOpStatus::Pending as u8,
            FileOpStatus::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Publish the payload and the terminal status, then wake waiters.
    pub(crate) fn finish(&self, status: FileOpStatus, payload: OperationPayload) {
        debug_assert!(status.is_terminal());
        *self.payload.lock().unwrap() = payload;
        self.status.store(status as u8, Ordering::Release);
        let mut done = self.done_lock.lock().unwrap();
        *done = true;
        self.done_cv.notify_all();
    }

    pub(crate) fn finish_failed(&self, error: FileErrorInfo, mut payload: OperationPayload) {
        payload.error = Some(error);
        self.finish(FileOpStatus::Failed, payload);
    }
}

// ---------------------------------------------------------------------------
// FileOperationHandle
// ---------------------------------------------------------------------------

/// Copyable handle to an in-flight (or finished) file operation.
#[derive(Clone)]
pub struct FileOperationHandle {
    state: Arc<OperationState>,
}

impl FileOperationHandle {
    pub(crate) fn new(state: Arc<OperationState>) -> Self {
        Self { state }
    }

    /// An already-terminal handle carrying `status` and no payload. Used for
    /// operations rejected before submission.
    pub fn immediate(status: FileOpStatus) -> Self {
        let state = OperationState::new();
        state.finish(status, OperationPayload::default());
        Self { state }
    }

    /// An already-failed handle carrying `error`.
    pub(crate) fn failed(error: FileErrorInfo) -> Self {
        let state = OperationState::new();
        state.finish_failed(error, OperationPayload::default());
        Self { state }
    }

    /// Current status; never blocks.
    pub fn status(&self) -> FileOpStatus {
        self.state.status()
    }

    /// Block until the operation reaches a terminal status and return it.
    ///
    /// Between waits the operation's progress thunk runs (when present) so a
    /// worker waiting on work it enqueued into its own pool keeps the pool
    /// draining.
    pub fn wait(&self) -> FileOpStatus {
        loop {
            let status = self.state.status();
            if status.is_terminal() {
                return status;
            }

            let progress = self.state.progress.lock().unwrap().clone();
            if let Some(thunk) = progress {
                thunk();
            }

            let status = self.state.status();
            if status.is_terminal() {
                return status;
            }
            let done = self.state.done_lock.lock().unwrap();
            if !*done {
                let _ = self
                    .state
                    .done_cv
                    .wait_timeout(done, WAIT_POLL)
                    .unwrap();
            }
        }
    }

    /// Bytes produced by a read. Empty until terminal.
    pub fn contents_bytes(&self) -> Vec<u8> {
        self.state
            .payload
            .lock()
            .unwrap()
            .bytes
            .clone()
            .unwrap_or_default()
    }

    /// Text produced by a text-level operation (e.g. `read_line`), falling
    /// back to a UTF-8 view of the byte payload.
    pub fn contents_text(&self) -> String {
        let payload = self.state.payload.lock().unwrap();
        if let Some(text) = &payload.text {
            return text.clone();
        }
        payload
            .bytes
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    /// Bytes written by a write.
    pub fn bytes_written(&self) -> u64 {
        self.state.payload.lock().unwrap().wrote
    }

    /// Metadata produced by a metadata query.
    pub fn metadata(&self) -> Option<FileMetadata> {
        self.state.payload.lock().unwrap().metadata.clone()
    }

    /// Entries produced by a directory listing.
    pub fn directory_entries(&self) -> Vec<DirectoryEntry> {
        self.state
            .payload
            .lock()
            .unwrap()
            .entries
            .clone()
            .unwrap_or_default()
    }

    /// Per-path metadata produced by a batch query, in input order.
    pub fn metadata_batch(&self) -> Vec<FileMetadata> {
        self.state
            .payload
            .lock()
            .unwrap()
            .metadata_batch
            .clone()
            .unwrap_or_default()
    }

    /// Error details for a `Failed` operation.
    pub fn error_info(&self) -> Option<FileErrorInfo> {
        self.state.payload.lock().unwrap().error.clone()
    }

    /// Convenience: the error code, `None` when not failed.
    pub fn error_code(&self) -> Option<FileError> {
        self.error_info().map(|e| e.code)
    }
}

impl std::fmt::Debug for FileOperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileOperationHandle")
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
