//! Configuration, option, and data types shared across the VFS.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// VFS configuration
// ---------------------------------------------------------------------------

/// What to do when a backend cannot grant an exclusive write scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvisoryFallback {
    /// Fail fast with `Conflict` / `Timeout` / `IOError` depending on why.
    None,
    /// Take the in-process per-path lock, bounded by
    /// [`VfsConfig::advisory_acquire_timeout`].
    FallbackWithTimeout,
    /// Block on the in-process per-path lock without a timeout.
    FallbackThenWait,
}

/// Configuration for a `VirtualFileSystem`.
#[derive(Debug, Clone)]
pub struct VfsConfig {
    /// Serialize writes per normalized path.
    pub serialize_writes_per_path: bool,
    /// Bound on the per-path write-lock cache.
    pub max_write_locks_cached: usize,
    /// Idle age after which cached write locks may be evicted.
    pub write_lock_timeout: Duration,
    /// Default for operations that leave `create_parent_dirs` unset.
    pub default_create_parent_dirs: bool,
    /// Policy when the backend declines a write scope.
    pub advisory_fallback: AdvisoryFallback,
    /// Bound for `FallbackWithTimeout` lock acquisition.
    pub advisory_acquire_timeout: Duration,
    /// Use a cross-process sidecar lock file by default.
    pub default_use_lock_file: bool,
    /// Bound for sidecar lock-file acquisition.
    pub lock_acquire_timeout: Duration,
    /// Suffix for sidecar lock files.
    pub lock_suffix: String,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            serialize_writes_per_path: true,
            max_write_locks_cached: 1024,
            write_lock_timeout: Duration::from_secs(5 * 60),
            default_create_parent_dirs: true,
            advisory_fallback: AdvisoryFallback::FallbackThenWait,
            advisory_acquire_timeout: Duration::from_secs(5),
            default_use_lock_file: false,
            lock_acquire_timeout: Duration::from_secs(5),
            lock_suffix: ".lock".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Operation options
// ---------------------------------------------------------------------------

/// Options for read operations.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Starting byte offset.
    pub offset: u64,
    /// Maximum bytes to read; `None` reads to EOF.
    pub length: Option<usize>,
}

impl ReadOptions {
    pub fn range(offset: u64, length: usize) -> Self {
        Self {
            offset,
            length: Some(length),
        }
    }
}

/// Options for write operations.
///
/// The `Option<bool>` fields are tri-state: `None` defers to the VFS default
/// (`create_parent_dirs`) or to "preserve what the file had"
/// (`ensure_final_newline`).
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Starting byte offset (ignored when `append`).
    pub offset: u64,
    /// Append to the end of the file.
    pub append: bool,
    /// Create the file if it does not exist.
    pub create_if_missing: bool,
    /// Truncate before writing (whole-file writes).
    pub truncate: bool,
    /// Create missing parent directories; `None` = VFS default.
    pub create_parent_dirs: Option<bool>,
    /// Force a trailing newline; `None` = preserve the source state.
    pub ensure_final_newline: Option<bool>,
    /// Flush file contents to stable storage before returning.
    pub fsync: bool,
    /// Serialize against other processes via a sidecar lock file;
    /// `None` = VFS default.
    pub use_lock_file: Option<bool>,
    /// Sidecar lock acquisition timeout; `None` = VFS default.
    pub lock_timeout: Option<Duration>,
    /// Sidecar lock-file suffix; `None` = VFS default.
    pub lock_suffix: Option<String>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            append: false,
            create_if_missing: true,
            truncate: true,
            create_parent_dirs: None,
            ensure_final_newline: None,
            fsync: false,
            use_lock_file: None,
            lock_timeout: None,
            lock_suffix: None,
        }
    }
}

impl WriteOptions {
    /// Options for a positional write that must not truncate.
    pub fn at_offset(offset: u64) -> Self {
        Self {
            offset,
            truncate: false,
            ..Self::default()
        }
    }

    /// Options for appending.
    pub fn appending() -> Self {
        Self {
            append: true,
            truncate: false,
            ..Self::default()
        }
    }
}

/// Stream access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Read,
    Write,
    ReadWrite,
}

/// Options for opening a file stream.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub mode: StreamMode,
    pub append: bool,
    pub buffered: bool,
    pub buffer_size: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            mode: StreamMode::Read,
            append: false,
            buffered: false,
            buffer_size: 64 * 1024,
        }
    }
}

/// Sort order for directory listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    None,
    ByName,
    BySize,
    ByModifiedTime,
}

/// Predicate deciding whether a listing entry is included.
pub type ListFilter = Arc<dyn Fn(&DirectoryEntry) -> bool + Send + Sync>;

/// Options controlling directory listings.
#[derive(Clone, Default)]
pub struct ListDirectoryOptions {
    /// Recurse into subdirectories.
    pub recursive: bool,
    /// Follow symlinked directories while recursing.
    pub follow_symlinks: bool,
    /// Maximum recursion depth; `None` = unlimited.
    pub max_depth: Option<usize>,
    /// Glob filter applied to file names (`*` and `?`).
    pub glob_pattern: Option<String>,
    /// Optional predicate callback.
    pub filter: Option<ListFilter>,
    /// Include hidden entries.
    pub include_hidden: bool,
    /// Sort order, applied before pagination.
    pub sort_by: SortOrder,
    /// Keep only the first N results *after* sorting; `0` = unlimited.
    pub max_results: usize,
}

impl std::fmt::Debug for ListDirectoryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListDirectoryOptions")
            .field("recursive", &self.recursive)
            .field("max_depth", &self.max_depth)
            .field("glob_pattern", &self.glob_pattern)
            .field("has_filter", &self.filter.is_some())
            .field("include_hidden", &self.include_hidden)
            .field("sort_by", &self.sort_by)
            .field("max_results", &self.max_results)
            .finish()
    }
}

/// Options for batch metadata queries.
#[derive(Debug, Clone, Default)]
pub struct BatchMetadataOptions {
    pub paths: Vec<PathBuf>,
}

/// Progress callback for chunked copies; returning `false` cancels.
pub type CopyProgress = Arc<dyn Fn(u64, u64) -> bool + Send + Sync>;

/// Options controlling file copies.
#[derive(Clone)]
pub struct CopyOptions {
    /// Replace the destination if it exists.
    pub overwrite_existing: bool,
    /// Preserve permissions and modification time.
    pub preserve_attributes: bool,
    /// Try a copy-on-write / in-kernel fast path before chunking.
    pub use_reflink: bool,
    /// Create missing destination parents; `None` = VFS default.
    pub create_parent_dirs: Option<bool>,
    /// Progress callback; `false` cancels and removes the partial copy.
    pub progress: Option<CopyProgress>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            overwrite_existing: false,
            preserve_attributes: true,
            use_reflink: true,
            create_parent_dirs: None,
            progress: None,
        }
    }
}

impl std::fmt::Debug for CopyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyOptions")
            .field("overwrite_existing", &self.overwrite_existing)
            .field("preserve_attributes", &self.preserve_attributes)
            .field("use_reflink", &self.use_reflink)
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Metadata / directory entries
// ---------------------------------------------------------------------------

/// Metadata snapshot for one path.
///
/// Symlinks report `is_symlink = true` with the remaining fields describing
/// the link *target*. Nonexistent paths report `exists = false` with the
/// rest zeroed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub exists: bool,
    pub is_directory: bool,
    pub is_regular_file: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// Last modification time, milliseconds since the Unix epoch.
    pub last_modified_ms: Option<i64>,
}

/// One entry in a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// File or directory name, no path prefix.
    pub name: String,
    /// Complete path to the entry.
    pub full_path: PathBuf,
    pub metadata: FileMetadata,
    pub is_symlink: bool,
    pub symlink_target: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Line-level operations (write batches)
// ---------------------------------------------------------------------------

/// One deferred line mutation collected by a write batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineOperation {
    /// Assign `content` to `line`, extending the file with empty lines if
    /// needed.
    Write { line: usize, content: String },
    /// Insert `content` before `line` (clamped to the end).
    Insert { line: usize, content: String },
    /// Delete `line` if it exists.
    Delete { line: usize },
    /// Append `content` as a new final line.
    Append { content: String },
    /// Remove every line.
    Clear,
    /// Replace the whole file with `content` (split on newlines).
    ReplaceAll { content: String },
}

/// Apply a batch of line operations to a parsed line vector.
///
/// Order is fixed regardless of enqueue order: clear, then replace-all, then
/// deletes (highest index first), inserts (highest index first), sparse
/// writes (later writes to the same line win), and finally appends.
pub fn apply_line_operations(lines: &mut Vec<String>, ops: &[LineOperation]) {
    if ops.iter().any(|op| matches!(op, LineOperation::Clear)) {
        lines.clear();
    }
    for op in ops {
        if let LineOperation::ReplaceAll { content } = op {
            lines.clear();
            lines.extend(split_text_lines(content));
        }
    }

    let mut deletes: Vec<usize> = ops
        .iter()
        .filter_map(|op| match op {
            LineOperation::Delete { line } => Some(*line),
            _ => None,
        })
        .collect();
    deletes.sort_unstable_by(|a, b| b.cmp(a));
    for line in deletes {
        if line < lines.len() {
            lines.remove(line);
        }
    }

    let mut inserts: Vec<(usize, &String)> = ops
        .iter()
        .filter_map(|op| match op {
            LineOperation::Insert { line, content } => Some((*line, content)),
            _ => None,
        })
        .collect();
    inserts.sort_by(|a, b| b.0.cmp(&a.0));
    for (line, content) in inserts {
        let at = line.min(lines.len());
        lines.insert(at, content.clone());
    }

    for op in ops {
        if let LineOperation::Write { line, content } = op {
            while lines.len() <= *line {
                lines.push(String::new());
            }
            lines[*line] = content.clone();
        }
    }

    for op in ops {
        if let LineOperation::Append { content } = op {
            lines.push(content.clone());
        }
    }
}

/// Split text into logical lines, stripping a CR before each LF.
fn split_text_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// EOL detection
// ---------------------------------------------------------------------------

/// Line-ending convention of a text file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eol {
    Lf,
    CrLf,
}

impl Eol {
    /// The platform's native convention.
    pub fn platform() -> Self {
        if cfg!(windows) {
            Eol::CrLf
        } else {
            Eol::Lf
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Eol::Lf => "\n",
            Eol::CrLf => "\r\n",
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        self.as_str().as_bytes()
    }
}

/// Detect the dominant line ending by counting occurrences; empty or
/// ambiguous input falls back to the platform convention.
pub fn detect_eol(bytes: &[u8]) -> Eol {
    let mut crlf = 0usize;
    let mut lf = 0usize;
    let mut previous = 0u8;
    for &b in bytes {
        if b == b'\n' {
            if previous == b'\r' {
                crlf += 1;
            } else {
                lf += 1;
            }
        }
        previous = b;
    }
    match crlf.cmp(&lf) {
        std::cmp::Ordering::Greater => Eol::CrLf,
        std::cmp::Ordering::Less => Eol::Lf,
        std::cmp::Ordering::Equal => Eol::platform(),
    }
}

/// `true` when the content ends with a newline.
pub fn has_trailing_newline(bytes: &[u8]) -> bool {
    bytes.last() == Some(&b'\n')
}

/// Parse bytes into logical lines, stripping a CR before each LF. When the
/// content does not end with a newline, the final fragment is kept as the
/// last line.
pub fn split_lines(bytes: &[u8]) -> Vec<String> {
    if bytes.is_empty() {
        return Vec::new();
    }
    let text = String::from_utf8_lossy(bytes);
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect();
    if has_trailing_newline(bytes) {
        // The final split element is the empty tail after the last newline.
        lines.pop();
    }
    lines
}

/// Join lines with `eol`, appending a final `eol` when `trailing_newline`.
pub fn join_lines(lines: &[String], eol: Eol, trailing_newline: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(eol.as_bytes());
        }
        out.extend_from_slice(line.as_bytes());
    }
    if trailing_newline && !lines.is_empty() {
        out.extend_from_slice(eol.as_bytes());
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_eol_prefers_dominant_convention() {
        assert_eq!(detect_eol(b"a\r\nb\r\nc\n"), Eol::CrLf);
        assert_eq!(detect_eol(b"a\nb\nc\r\n"), Eol::Lf);
        assert_eq!(detect_eol(b""), Eol::platform());
    }

    #[test]
    fn split_lines_strips_cr_and_keeps_unterminated_tail() {
        assert_eq!(split_lines(b"a\r\nb\nc"), vec!["a", "b", "c"]);
        assert_eq!(split_lines(b"a\nb\n"), vec!["a", "b"]);
        assert_eq!(split_lines(b""), Vec::<String>::new());
    }

    #[test]
    fn join_lines_round_trips_with_trailing_newline() {
        let lines = vec!["x".to_string(), "y".to_string()];
        assert_eq!(join_lines(&lines, Eol::Lf, true), b"x\ny\n");
        assert_eq!(join_lines(&lines, Eol::CrLf, false), b"x\r\ny");
        assert_eq!(join_lines(&[], Eol::Lf, true), b"");
    }

    #[test]
    fn apply_order_clear_then_writes_then_appends() {
        let mut lines = vec!["old".to_string()];
        apply_line_operations(
            &mut lines,
            &[
                LineOperation::Append {
                    content: "tail".into(),
                },
                LineOperation::Clear,
                LineOperation::Write {
                    line: 0,
                    content: "head".into(),
                },
            ],
        );
        // Clear runs first regardless of enqueue order.
        assert_eq!(lines, vec!["head", "tail"]);
    }

    #[test]
    fn deletes_apply_highest_index_first() {
        let mut lines: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        apply_line_operations(
            &mut lines,
            &[
                LineOperation::Delete { line: 1 },
                LineOperation::Delete { line: 3 },
            ],
        );
        assert_eq!(lines, vec!["a", "c"]);
    }

    #[test]
    fn inserts_apply_highest_index_first() {
        // Applying highest-first makes each index refer to the ORIGINAL
        // numbering: inserting at 1 and 2 of [a, c] lands b before c and
        // tail after it.
        let mut lines: Vec<String> = ["a", "c"].iter().map(|s| s.to_string()).collect();
        apply_line_operations(
            &mut lines,
            &[
                LineOperation::Insert {
                    line: 1,
                    content: "b".into(),
                },
                LineOperation::Insert {
                    line: 2,
                    content: "tail".into(),
                },
            ],
        );
        assert_eq!(lines, vec!["a", "b", "c", "tail"]);
    }

    #[test]
    fn later_writes_override_earlier_ones() {
        let mut lines = Vec::new();
        apply_line_operations(
            &mut lines,
            &[
                LineOperation::Write {
                    line: 2,
                    content: "first".into(),
                },
                LineOperation::Write {
                    line: 2,
                    content: "second".into(),
                },
            ],
        );
        assert_eq!(lines, vec!["", "", "second"]);
    }

    #[test]
    fn replace_all_clears_then_sets() {
        let mut lines = vec!["junk".to_string(), "more".to_string()];
        apply_line_operations(
            &mut lines,
            &[LineOperation::ReplaceAll {
                content: "one\ntwo".into(),
            }],
        );
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn line_operations_serialize_stably() {
        let ops = vec![
            LineOperation::Write {
                line: 3,
                content: "w".into(),
            },
            LineOperation::Delete { line: 1 },
            LineOperation::Append { content: "a".into() },
            LineOperation::Clear,
        ];
        let json = serde_json::to_string(&ops).unwrap();
        let parsed: Vec<LineOperation> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ops);
        let json2 = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn default_config_is_serialized_and_bounded() {
        let config = VfsConfig::default();
        assert!(config.serialize_writes_per_path);
        assert!(config.max_write_locks_cached > 0);
        assert_eq!(config.lock_suffix, ".lock");
    }
}
