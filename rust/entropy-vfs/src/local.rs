//! Local-disk backend.
//!
//! Implements [`FileSystemBackend`] against `std::fs` with the contracts the
//! facade depends on:
//!
//! * special files (FIFOs, sockets, devices) are rejected with
//!   `InvalidPath` before any open;
//! * line-level writes and batch commits are **atomic**: content is staged
//!   in a secure temp file in the destination's directory and renamed over
//!   the target in one step, preserving the file's EOL convention,
//!   trailing-newline state, and (on Unix) permissions;
//! * directory listings filter (hidden, glob, predicate), then sort, then
//!   paginate — `max_results` applies after sorting so page one is the
//!   top-N in the requested order;
//! * when lock-file mode is enabled, writes additionally serialize against
//!   other processes by holding an OS file lock on a sidecar
//!   `<target><suffix>` file, bounded by the resolved lock timeout;
//! * every failure maps onto the stable [`FileError`] taxonomy.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, UNIX_EPOCH};

use crate::backend::{
    BackendCapabilities, FileSystemBackend, MoveOutcome, ReadOutput,
};
use crate::error::{FileError, FileErrorInfo, VfsResult};
use crate::stream::FileStream;
use crate::types::{
    apply_line_operations, detect_eol, has_trailing_newline, join_lines, split_lines,
    BatchMetadataOptions, CopyOptions, DirectoryEntry, Eol, FileMetadata, LineOperation,
    ListDirectoryOptions, ReadOptions, SortOrder, StreamOptions, WriteOptions,
};

/// Chunk size for copies that report progress.
const COPY_CHUNK: usize = 1024 * 1024;

/// Poll interval while waiting on a contended sidecar lock file.
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Fallback sidecar acquisition bound when no timeout was resolved.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Fallback sidecar suffix when none was resolved.
const DEFAULT_LOCK_SUFFIX: &str = ".lock";

/// Rename-over-destination retries on Windows sharing violations.
#[cfg(windows)]
const REPLACE_RETRIES: u32 = 8;

/// Backend for the machine's own filesystem.
#[derive(Debug, Default)]
pub struct LocalFileSystemBackend;

/// A held sidecar lock file; the OS lock releases when this drops.
struct SidecarLock {
    file: File,
}

impl Drop for SidecarLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl LocalFileSystemBackend {
    pub fn new() -> Self {
        Self
    }

    /// Take the cross-process sidecar lock for `path` when the resolved
    /// options ask for one.
    ///
    /// Locks `<path><suffix>` with an OS file lock, polling until the
    /// resolved timeout elapses. The sidecar file itself is left in place on
    /// release (removing it would race other waiters holding the same
    /// inode); dropping the returned guard unlocks it.
    fn acquire_sidecar_lock(
        &self,
        path: &Path,
        options: &WriteOptions,
    ) -> VfsResult<Option<SidecarLock>> {
        if options.use_lock_file != Some(true) {
            return Ok(None);
        }
        let suffix = options.lock_suffix.as_deref().unwrap_or(DEFAULT_LOCK_SUFFIX);
        let mut lock_path = path.as_os_str().to_os_string();
        lock_path.push(suffix);
        let lock_path = PathBuf::from(lock_path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| FileErrorInfo::from_io_context(e, path, "opening lock file"))?;

        let timeout = options.lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT);
        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(Some(SidecarLock { file })),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(FileErrorInfo::new(
                            FileError::Timeout,
                            "lock acquisition timed out",
                            Some(path),
                        ));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(TryLockError::Error(e)) => {
                    return Err(FileErrorInfo::from_io_context(
                        e,
                        path,
                        "acquiring lock file",
                    ))
                }
            }
        }
    }

    /// Stage `bytes` in a sibling temp file and atomically replace `path`.
    ///
    /// Permissions of an existing destination are preserved on Unix. On
    /// failure the temp file is removed and the original error surfaced.
    fn atomic_write(&self, path: &Path, bytes: &[u8], fsync: bool) -> VfsResult<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                FileErrorInfo::new(FileError::InvalidPath, "path has no file name", Some(path))
            })?;

        let mut temp = tempfile::Builder::new()
            .prefix(&format!("{}.tmp", file_name))
            .tempfile_in(&parent)
            .map_err(|e| FileErrorInfo::from_io_context(e, path, "creating temp file"))?;

        temp.write_all(bytes)
            .and_then(|_| temp.flush())
            .map_err(|e| FileErrorInfo::from_io_context(e, path, "writing temp file"))?;
        if fsync {
            temp.as_file()
                .sync_all()
                .map_err(|e| FileErrorInfo::from_io_context(e, path, "syncing temp file"))?;
        }

        #[cfg(unix)]
        if let Ok(existing) = fs::metadata(path) {
            // Keep the destination's permission bits across the replace.
            let _ = fs::set_permissions(temp.path(), existing.permissions());
        }

        self.replace_with_temp(temp.into_temp_path(), path)
    }

    #[cfg(not(windows))]
    fn replace_with_temp(&self, temp: tempfile::TempPath, path: &Path) -> VfsResult<()> {
        // A failed persist drops `temp`, which removes the file.
        temp.persist(path)
            .map_err(|e| FileErrorInfo::from_io_context(e.error, path, "atomic replace"))
    }

    #[cfg(windows)]
    fn replace_with_temp(&self, temp: tempfile::TempPath, path: &Path) -> VfsResult<()> {
        // Sharing violations from scanners/indexers are transient; retry a
        // bounded number of times before giving up.
        let mut temp = temp;
        let mut attempt = 0;
        loop {
            match temp.persist(path) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < REPLACE_RETRIES => {
                    temp = e.path;
                    attempt += 1;
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(FileErrorInfo::from_io_context(
                        e.error,
                        path,
                        "atomic replace",
                    ))
                }
            }
        }
    }

    /// Parse the target into `(lines, eol, trailing_newline, existed)`.
    fn read_lines_state(&self, path: &Path) -> VfsResult<(Vec<String>, Eol, bool, bool)> {
        match fs::read(path) {
            Ok(bytes) => {
                let eol = detect_eol(&bytes);
                let trailing = has_trailing_newline(&bytes);
                Ok((split_lines(&bytes), eol, trailing, true))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // New files default to the platform convention and a final
                // newline.
                Ok((Vec::new(), Eol::platform(), true, false))
            }
            Err(e) => Err(FileErrorInfo::from_io(e, path)),
        }
    }

    fn ensure_parent_dirs(&self, path: &Path) -> VfsResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| FileErrorInfo::from_io_context(e, path, "creating parents"))?;
            }
        }
        Ok(())
    }

    fn reject_special(&self, path: &Path) -> VfsResult<()> {
        if is_special_file(path) {
            return Err(FileErrorInfo::new(
                FileError::InvalidPath,
                "refusing to operate on a special file",
                Some(path),
            ));
        }
        Ok(())
    }

    fn chunked_copy(
        &self,
        source: &Path,
        destination: &Path,
        options: &CopyOptions,
        total: u64,
    ) -> VfsResult<u64> {
        let mut src = File::open(source).map_err(|e| FileErrorInfo::from_io(e, source))?;
        let mut dst =
            File::create(destination).map_err(|e| FileErrorInfo::from_io(e, destination))?;

        let mut copied = 0u64;
        let mut chunk = vec![0u8; COPY_CHUNK];
        loop {
            let n = src
                .read(&mut chunk)
                .map_err(|e| FileErrorInfo::from_io(e, source))?;
            if n == 0 {
                break;
            }
            dst.write_all(&chunk[..n])
                .map_err(|e| FileErrorInfo::from_io(e, destination))?;
            copied += n as u64;

            if let Some(progress) = &options.progress {
                if !progress(copied, total) {
                    drop(dst);
                    let _ = fs::remove_file(destination);
                    return Err(FileErrorInfo::new(
                        FileError::IoError,
                        "copy cancelled by progress callback",
                        Some(destination),
                    ));
                }
            }
        }
        Ok(copied)
    }
}

impl FileSystemBackend for LocalFileSystemBackend {
    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_atomic_writes: true,
            ..Default::default()
        }
    }

    /// Weakly-canonical path string: the deepest existing ancestor is
    /// resolved through the filesystem, the rest appended lexically.
    /// Lowercased on case-insensitive platforms.
    fn normalize_key(&self, path: &Path) -> String {
        let canonical = weakly_canonicalize(path);
        let key = canonical.to_string_lossy().into_owned();
        if cfg!(windows) {
            key.to_lowercase()
        } else {
            key
        }
    }

    fn read_file(&self, path: &Path, options: &ReadOptions) -> VfsResult<ReadOutput> {
        self.reject_special(path)?;
        let mut file = File::open(path).map_err(|e| FileErrorInfo::from_io(e, path))?;
        if options.offset > 0 {
            file.seek(SeekFrom::Start(options.offset))
                .map_err(|e| FileErrorInfo::from_io(e, path))?;
        }

        match options.length {
            Some(length) => {
                let mut bytes = vec![0u8; length];
                let mut filled = 0usize;
                while filled < length {
                    let n = file
                        .read(&mut bytes[filled..])
                        .map_err(|e| FileErrorInfo::from_io(e, path))?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                bytes.truncate(filled);
                Ok(ReadOutput {
                    partial: filled < length,
                    bytes,
                })
            }
            None => {
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)
                    .map_err(|e| FileErrorInfo::from_io(e, path))?;
                Ok(ReadOutput {
                    bytes,
                    partial: false,
                })
            }
        }
    }

    fn write_file(&self, path: &Path, data: &[u8], options: &WriteOptions) -> VfsResult<u64> {
        self.reject_special(path)?;
        if options.create_parent_dirs.unwrap_or(false) {
            self.ensure_parent_dirs(path)?;
        }
        let _lock = self.acquire_sidecar_lock(path, options)?;

        let mut open = OpenOptions::new();
        open.write(true).create(options.create_if_missing);
        if options.append {
            open.append(true);
        } else if options.truncate && options.offset == 0 {
            open.truncate(true);
        }
        let mut file = open.open(path).map_err(|e| FileErrorInfo::from_io(e, path))?;

        if !options.append && options.offset > 0 {
            file.seek(SeekFrom::Start(options.offset))
                .map_err(|e| FileErrorInfo::from_io(e, path))?;
        }
        file.write_all(data)
            .map_err(|e| FileErrorInfo::from_io(e, path))?;
        let mut wrote = data.len() as u64;

        // Whole-file writes may ask for a guaranteed trailing newline.
        let whole_file = !options.append && options.offset == 0;
        if options.ensure_final_newline == Some(true) && whole_file && !data.ends_with(b"\n") {
            let eol = Eol::platform();
            file.write_all(eol.as_bytes())
                .map_err(|e| FileErrorInfo::from_io(e, path))?;
            wrote += eol.as_bytes().len() as u64;
        }

        if options.fsync {
            // sync_all is the strongest flush std offers on every platform
            // (F_FULLFSYNC on Darwin).
            file.sync_all()
                .map_err(|e| FileErrorInfo::from_io(e, path))?;
        }
        Ok(wrote)
    }

    fn delete_file(&self, path: &Path) -> VfsResult<()> {
        fs::remove_file(path).map_err(|e| FileErrorInfo::from_io(e, path))
    }

    fn create_file(&self, path: &Path) -> VfsResult<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map(|_| ())
            .map_err(|e| FileErrorInfo::from_io(e, path))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists() || fs::symlink_metadata(path).is_ok()
    }

    fn metadata(&self, path: &Path) -> VfsResult<FileMetadata> {
        let symlink_meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FileMetadata {
                    path: path.to_path_buf(),
                    ..Default::default()
                });
            }
            Err(e) => return Err(FileErrorInfo::from_io(e, path)),
        };

        let is_symlink = symlink_meta.file_type().is_symlink();
        // Symlinks report the target's stats (dangling links keep zeros).
        let stat = if is_symlink {
            fs::metadata(path).ok()
        } else {
            Some(symlink_meta)
        };

        let mut meta = FileMetadata {
            path: path.to_path_buf(),
            exists: true,
            is_symlink,
            ..Default::default()
        };
        if let Some(stat) = stat {
            meta.is_directory = stat.is_dir();
            meta.is_regular_file = stat.is_file();
            meta.size = stat.len();
            meta.last_modified_ms = stat
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64);
            let (readable, writable, executable) = access_bits(&stat);
            meta.readable = readable;
            meta.writable = writable;
            meta.executable = executable;
        }
        Ok(meta)
    }

    fn metadata_batch(&self, options: &BatchMetadataOptions) -> VfsResult<Vec<FileMetadata>> {
        // Input order preserved; missing entries come back exists = false.
        options.paths.iter().map(|p| self.metadata(p)).collect()
    }

    /// Note: the `create_parents` flag is currently ignored — parents are
    /// always created. Kept for interface compatibility.
    fn create_directory(&self, path: &Path, _create_parents: bool) -> VfsResult<()> {
        fs::create_dir_all(path).map_err(|e| FileErrorInfo::from_io(e, path))
    }

    fn remove_directory(&self, path: &Path, recursive: bool) -> VfsResult<()> {
        let result = if recursive {
            fs::remove_dir_all(path)
        } else {
            fs::remove_dir(path)
        };
        result.map_err(|e| FileErrorInfo::from_io(e, path))
    }

    fn list_directory(
        &self,
        path: &Path,
        options: &ListDirectoryOptions,
    ) -> VfsResult<Vec<DirectoryEntry>> {
        if !path.exists() {
            return Err(FileErrorInfo::new(
                FileError::FileNotFound,
                "directory does not exist",
                Some(path),
            ));
        }
        let pattern = match &options.glob_pattern {
            Some(p) => Some(glob::Pattern::new(p).map_err(|e| {
                FileErrorInfo::new(
                    FileError::InvalidPath,
                    format!("invalid glob pattern: {}", e),
                    Some(path),
                )
            })?),
            None => None,
        };

        let mut entries = Vec::new();
        self.walk_directory(path, 1, options, pattern.as_ref(), &mut entries)?;

        match options.sort_by {
            SortOrder::None => {}
            SortOrder::ByName => entries.sort_by(|a, b| a.name.cmp(&b.name)),
            SortOrder::BySize => entries.sort_by_key(|e| e.metadata.size),
            SortOrder::ByModifiedTime => entries.sort_by_key(|e| e.metadata.last_modified_ms),
        }

        // Pagination applies after sorting so page one is the top-N.
        if options.max_results > 0 && entries.len() > options.max_results {
            entries.truncate(options.max_results);
        }
        Ok(entries)
    }

    fn read_line(&self, path: &Path, line_number: usize) -> VfsResult<String> {
        let bytes = fs::read(path).map_err(|e| FileErrorInfo::from_io(e, path))?;
        let lines = split_lines(&bytes);
        lines.get(line_number).cloned().ok_or_else(|| {
            FileErrorInfo::new(
                FileError::InvalidPath,
                format!("line {} out of range ({} lines)", line_number, lines.len()),
                Some(path),
            )
        })
    }

    fn write_line(
        &self,
        path: &Path,
        line_number: usize,
        content: &str,
        options: &WriteOptions,
    ) -> VfsResult<u64> {
        self.reject_special(path)?;
        if options.create_parent_dirs.unwrap_or(false) {
            self.ensure_parent_dirs(path)?;
        }
        let _lock = self.acquire_sidecar_lock(path, options)?;

        let (mut lines, eol, trailing, _existed) = self.read_lines_state(path)?;
        while lines.len() <= line_number {
            lines.push(String::new());
        }
        lines[line_number] = content.to_string();

        let out = join_lines(&lines, eol, trailing);
        self.atomic_write(path, &out, options.fsync)?;
        Ok(out.len() as u64)
    }

    fn commit_lines(
        &self,
        path: &Path,
        operations: &[LineOperation],
        options: &WriteOptions,
    ) -> VfsResult<u64> {
        self.reject_special(path)?;
        if options.create_parent_dirs.unwrap_or(false) {
            self.ensure_parent_dirs(path)?;
        }
        let _lock = self.acquire_sidecar_lock(path, options)?;

        let (mut lines, eol, source_trailing, existed) = self.read_lines_state(path)?;
        apply_line_operations(&mut lines, operations);

        let trailing = match options.ensure_final_newline {
            Some(explicit) => explicit,
            None => source_trailing || !existed,
        };
        let out = join_lines(&lines, eol, trailing);
        self.atomic_write(path, &out, options.fsync)?;
        Ok(out.len() as u64)
    }

    fn copy_file(
        &self,
        source: &Path,
        destination: &Path,
        options: &CopyOptions,
    ) -> VfsResult<u64> {
        self.reject_special(source)?;
        if !options.overwrite_existing && destination.exists() {
            return Err(FileErrorInfo::new(
                FileError::Conflict,
                "destination already exists",
                Some(destination),
            ));
        }
        if options.create_parent_dirs.unwrap_or(false) {
            self.ensure_parent_dirs(destination)?;
        }

        let total = fs::metadata(source)
            .map_err(|e| FileErrorInfo::from_io(e, source))?
            .len();

        // std::fs::copy is the fast path (copy_file_range / clonefile where
        // the platform offers them); chunking is only needed for progress.
        let copied = if options.use_reflink && options.progress.is_none() {
            fs::copy(source, destination).map_err(|e| FileErrorInfo::from_io(e, destination))?
        } else {
            self.chunked_copy(source, destination, options, total)?
        };

        if options.preserve_attributes {
            if let Ok(meta) = fs::metadata(source) {
                let _ = fs::set_permissions(destination, meta.permissions());
                if let (Ok(mtime), Ok(file)) = (
                    meta.modified(),
                    OpenOptions::new().write(true).open(destination),
                ) {
                    let _ = file.set_modified(mtime);
                }
            }
        }
        Ok(copied)
    }

    fn move_file(
        &self,
        source: &Path,
        destination: &Path,
        overwrite_existing: bool,
    ) -> VfsResult<MoveOutcome> {
        if !overwrite_existing && destination.exists() {
            return Err(FileErrorInfo::new(
                FileError::Conflict,
                "destination already exists",
                Some(destination),
            ));
        }

        match fs::rename(source, destination) {
            Ok(()) => Ok(MoveOutcome::Moved),
            Err(rename_err) => {
                // Cross-device (or similar) rename failure: copy then delete.
                if !source.exists() {
                    return Err(FileErrorInfo::from_io(rename_err, source));
                }
                fs::copy(source, destination)
                    .map_err(|e| FileErrorInfo::from_io(e, destination))?;
                match fs::remove_file(source) {
                    Ok(()) => Ok(MoveOutcome::Moved),
                    Err(e) => {
                        tracing::warn!(
                            source = %source.display(),
                            "move fell back to copy but the source could not be removed: {}",
                            e
                        );
                        Ok(MoveOutcome::Partial)
                    }
                }
            }
        }
    }

    fn open_stream(&self, path: &Path, options: &StreamOptions) -> VfsResult<FileStream> {
        self.reject_special(path)?;
        FileStream::open(path, options)
    }
}

impl LocalFileSystemBackend {
    fn walk_directory(
        &self,
        dir: &Path,
        depth: usize,
        options: &ListDirectoryOptions,
        pattern: Option<&glob::Pattern>,
        out: &mut Vec<DirectoryEntry>,
    ) -> VfsResult<()> {
        let reader = fs::read_dir(dir).map_err(|e| FileErrorInfo::from_io(e, dir))?;
        for entry in reader {
            let entry = entry.map_err(|e| FileErrorInfo::from_io(e, dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let full_path = entry.path();

            if !options.include_hidden && is_hidden(&name) {
                continue;
            }

            let metadata = self.metadata(&full_path)?;
            let is_symlink = metadata.is_symlink;
            let symlink_target = if is_symlink {
                fs::read_link(&full_path).ok()
            } else {
                None
            };

            let matches_glob = pattern.is_none_or(|p| p.matches(&name));
            let dir_entry = DirectoryEntry {
                name,
                full_path: full_path.clone(),
                metadata: metadata.clone(),
                is_symlink,
                symlink_target,
            };
            let passes_filter = options
                .filter
                .as_ref()
                .is_none_or(|filter| filter(&dir_entry));

            if matches_glob && passes_filter {
                out.push(dir_entry);
            }

            let may_descend = options.recursive
                && metadata.is_directory
                && (options.follow_symlinks || !is_symlink)
                && options.max_depth.is_none_or(|max| depth < max);
            if may_descend {
                self.walk_directory(&full_path, depth + 1, options, pattern, out)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform helpers
// ---------------------------------------------------------------------------

/// FIFOs, sockets, and device nodes are off-limits.
#[cfg(unix)]
fn is_special_file(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            let ft = meta.file_type();
            ft.is_fifo() || ft.is_socket() || ft.is_block_device() || ft.is_char_device()
        }
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_special_file(_path: &Path) -> bool {
    false
}

/// Approximate current-process read/write/execute access from mode bits.
#[cfg(unix)]
fn access_bits(meta: &fs::Metadata) -> (bool, bool, bool) {
    use std::os::unix::fs::PermissionsExt;
    let mode = meta.permissions().mode();
    (
        mode & 0o444 != 0,
        mode & 0o222 != 0,
        mode & 0o111 != 0,
    )
}

#[cfg(not(unix))]
fn access_bits(meta: &fs::Metadata) -> (bool, bool, bool) {
    let writable = !meta.permissions().readonly();
    (true, writable, false)
}

/// Hidden = dot-prefixed. (On Windows the attribute-based check degrades to
/// the same rule.)
fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Resolve the deepest existing ancestor through the filesystem and append
/// the remainder lexically.
fn weakly_canonicalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_default()
            .join(path)
    };
    let normalized = lexical_normalize(&absolute);

    let mut existing = normalized.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(&existing) {
            let mut out = canonical;
            for component in tail.iter().rev() {
                out.push(component);
            }
            return out;
        }
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                existing.pop();
            }
            None => break,
        }
    }
    normalized
}

/// Purely lexical `.`/`..` resolution.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components: Vec<std::path::Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if matches!(components.last(), Some(std::path::Component::Normal(_))) {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            _ => components.push(component),
        }
    }
    components.iter().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
