//! Sequential file streams opened through a backend.
//!
//! Streams are the synchronous escape hatch: unlike the rest of the VFS they
//! do not route through contracts, since a stream's whole point is for the
//! caller to interleave reads/writes/seeks at its own pace. Buffered
//! variants wrap the file in a `BufReader`/`BufWriter` of the requested
//! size.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{FileError, FileErrorInfo, VfsResult};
use crate::types::{StreamMode, StreamOptions};

/// Where a seek is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDir {
    Begin,
    Current,
    End,
}

enum StreamInner {
    Plain(File),
    Reader(BufReader<File>),
    Writer(BufWriter<File>),
}

/// A sequential read/write stream over one file.
pub struct FileStream {
    inner: StreamInner,
    mode: StreamMode,
    path: PathBuf,
}

impl FileStream {
    /// Open `path` per `options`. Write modes create the file when missing;
    /// `append` positions every write at the end.
    pub fn open(path: &Path, options: &StreamOptions) -> VfsResult<Self> {
        let mut open = OpenOptions::new();
        match options.mode {
            StreamMode::Read => {
                open.read(true);
            }
            StreamMode::Write => {
                open.write(true).create(true);
                if options.append {
                    open.append(true);
                } else {
                    open.truncate(true);
                }
            }
            StreamMode::ReadWrite => {
                open.read(true).write(true).create(true);
            }
        }
        let file = open
            .open(path)
            .map_err(|e| FileErrorInfo::from_io(e, path))?;

        let inner = if options.buffered {
            match options.mode {
                StreamMode::Read => {
                    StreamInner::Reader(BufReader::with_capacity(options.buffer_size, file))
                }
                StreamMode::Write => {
                    StreamInner::Writer(BufWriter::with_capacity(options.buffer_size, file))
                }
                // Buffering a read-write stream would need coordinated
                // invalidation; hand back the raw file instead.
                StreamMode::ReadWrite => StreamInner::Plain(file),
            }
        } else {
            StreamInner::Plain(file)
        };

        Ok(Self {
            inner,
            mode: options.mode,
            path: path.to_path_buf(),
        })
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read up to `buf.len()` bytes; returns the count (0 at EOF).
    pub fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        if self.mode == StreamMode::Write {
            return Err(self.mode_error("stream not open for reading"));
        }
        let result = match &mut self.inner {
            StreamInner::Plain(file) => file.read(buf),
            StreamInner::Reader(reader) => reader.read(buf),
            StreamInner::Writer(_) => unreachable!("writer stream rejected above"),
        };
        result.map_err(|e| FileErrorInfo::from_io(e, &self.path))
    }

    /// Read everything from the current position to EOF.
    pub fn read_to_end(&mut self) -> VfsResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }

    /// Write the full buffer; returns the count written.
    pub fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        if self.mode == StreamMode::Read {
            return Err(self.mode_error("stream not open for writing"));
        }
        let result = match &mut self.inner {
            StreamInner::Plain(file) => file.write_all(buf),
            StreamInner::Writer(writer) => writer.write_all(buf),
            StreamInner::Reader(_) => unreachable!("reader stream rejected above"),
        };
        result
            .map(|_| buf.len())
            .map_err(|e| FileErrorInfo::from_io(e, &self.path))
    }

    /// Flush buffered writes down to the OS.
    pub fn flush(&mut self) -> VfsResult<()> {
        let result = match &mut self.inner {
            StreamInner::Plain(file) => file.flush(),
            StreamInner::Writer(writer) => writer.flush(),
            StreamInner::Reader(_) => Ok(()),
        };
        result.map_err(|e| FileErrorInfo::from_io(e, &self.path))
    }

    /// Move the cursor; returns the new absolute position.
    pub fn seek(&mut self, dir: SeekDir, offset: i64) -> VfsResult<u64> {
        let pos = match dir {
            SeekDir::Begin => SeekFrom::Start(offset.max(0) as u64),
            SeekDir::Current => SeekFrom::Current(offset),
            SeekDir::End => SeekFrom::End(offset),
        };
        let result = match &mut self.inner {
            StreamInner::Plain(file) => file.seek(pos),
            StreamInner::Reader(reader) => reader.seek(pos),
            StreamInner::Writer(writer) => writer.seek(pos),
        };
        result.map_err(|e| FileErrorInfo::from_io(e, &self.path))
    }

    /// Current cursor position.
    pub fn position(&mut self) -> VfsResult<u64> {
        self.seek(SeekDir::Current, 0)
    }

    fn mode_error(&self, message: &str) -> FileErrorInfo {
        FileErrorInfo::new(FileError::InvalidPath, message, Some(&self.path))
    }
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
