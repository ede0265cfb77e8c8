//! Offset-tracking line reader over a single log file.
//!
//! The watcher owns the open file handle and the byte position within it.
//! Lines longer than the configured limit are discarded whole rather than
//! split, and the stream keeps its offsets accurate across the discard.

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

/// One delimited line with its byte range in the file. `end_offset` includes
/// the newline, so it is the position the next line starts at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawLine {
    pub bytes: Bytes,
    pub start_offset: u64,
    pub end_offset: u64,
}

/// Identity and liveness of the file behind the watcher's path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileStatus {
    Unchanged,
    /// The path now points at a different file (device or inode changed).
    Rotated,
    /// The same file shrank below our read position.
    Truncated { len: u64 },
}

#[cfg(unix)]
fn file_id(metadata: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
fn file_id(_metadata: &std::fs::Metadata) -> (u64, u64) {
    (0, 0)
}

pub struct FileWatcher {
    path: PathBuf,
    reader: BufReader<File>,
    id: (u64, u64),
    max_line_bytes: usize,
    /// Position of the next unread byte.
    offset: u64,
    /// Position where the line currently being accumulated began.
    line_start: u64,
    partial: BytesMut,
    discarding: bool,
}

impl FileWatcher {
    /// Open the file and seek to `start_offset`.
    ///
    /// Returns the watcher plus a flag that is set when the file is already
    /// shorter than the requested offset, which means it was truncated or
    /// replaced since the offset was committed; reading then restarts at
    /// byte zero.
    pub async fn open(
        path: &Path,
        start_offset: u64,
        max_line_bytes: usize,
    ) -> std::io::Result<(Self, bool)> {
        let file = File::open(path).await?;
        let metadata = file.metadata().await?;
        let truncated = metadata.len() < start_offset;
        let offset = if truncated { 0 } else { start_offset };

        let mut reader = BufReader::new(file);
        reader.seek(std::io::SeekFrom::Start(offset)).await?;

        Ok((
            Self {
                path: path.to_owned(),
                reader,
                id: file_id(&metadata),
                max_line_bytes,
                offset,
                line_start: offset,
                partial: BytesMut::new(),
                discarding: false,
            },
            truncated,
        ))
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next complete line, or `None` at end of file.
    ///
    /// Cancel-safe: no bytes are consumed across an await point, so a
    /// cancelled call leaves the stream position intact. A partial line at
    /// EOF stays buffered until more bytes arrive or [`Self::finish`] claims
    /// it.
    pub async fn read_line(&mut self) -> std::io::Result<Option<RawLine>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if !self.discarding {
                        self.partial.extend_from_slice(&available[..pos]);
                    }
                    self.reader.consume(pos + 1);
                    self.offset += pos as u64 + 1;

                    if self.discarding {
                        warn!(
                            message = "Discarded line over the size limit.",
                            path = %self.path.display(),
                            start_offset = %self.line_start,
                            limit = %self.max_line_bytes,
                        );
                        self.discarding = false;
                        self.partial.clear();
                        self.line_start = self.offset;
                        continue;
                    }

                    let mut bytes = std::mem::take(&mut self.partial);
                    if bytes.last() == Some(&b'\r') {
                        bytes.truncate(bytes.len() - 1);
                    }
                    let line = RawLine {
                        bytes: bytes.freeze(),
                        start_offset: self.line_start,
                        end_offset: self.offset,
                    };
                    self.line_start = self.offset;
                    return Ok(Some(line));
                }
                None => {
                    let len = available.len();
                    if !self.discarding {
                        self.partial.extend_from_slice(available);
                    }
                    self.reader.consume(len);
                    self.offset += len as u64;
                    if self.partial.len() > self.max_line_bytes {
                        self.discarding = true;
                        self.partial.clear();
                    }
                }
            }
        }
    }

    /// Claim a trailing line without a final newline. Used at end of input in
    /// batch mode, where no more bytes will ever arrive.
    pub fn finish(&mut self) -> Option<RawLine> {
        if self.discarding || self.partial.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.partial);
        let line = RawLine {
            bytes: bytes.freeze(),
            start_offset: self.line_start,
            end_offset: self.offset,
        };
        self.line_start = self.offset;
        Some(line)
    }

    /// Stat the path by name and compare against the open handle.
    pub async fn status(&self) -> std::io::Result<FileStatus> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        if cfg!(unix) && file_id(&metadata) != self.id {
            return Ok(FileStatus::Rotated);
        }
        if metadata.len() < self.offset {
            return Ok(FileStatus::Truncated {
                len: metadata.len(),
            });
        }
        Ok(FileStatus::Unchanged)
    }
}
