use std::fmt;

use crate::error::{FileError, FileResult};

/// Chunk size used when streaming a byte range between two backends.
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Opaque file abstraction the storage core orchestrates.
///
/// The core never interprets file contents; it only opens, appends, copies
/// ranges, truncates and deletes. Implementations use interior mutability
/// and must be safe to share between the channel thread, the backup thread
/// and exporters.
///
/// All invariants:
/// - `open` takes an exclusive lock that is held until `close`.
/// - `append`, `read_at`, `truncate` and `copy_to` require an open file and
///   fail with [`FileError::Closed`] otherwise.
/// - `close` is idempotent.
/// - `delete` closes the file first and reports whether it existed.
pub trait FileBackend: Send + Sync + fmt::Debug {
    /// Stable, human-readable identifier (typically the full path).
    fn identifier(&self) -> &str;

    /// File name without any directory component.
    fn name(&self) -> &str;

    fn exists(&self) -> FileResult<bool>;

    /// Current length in bytes. A missing file has length 0.
    fn size(&self) -> FileResult<u64>;

    fn is_open(&self) -> bool;

    /// Open for reading and appending, creating the file if missing, and
    /// take the exclusive lock. A no-op on an already open file.
    fn open(&self) -> FileResult<()>;

    /// Fill `buf` with the bytes starting at `position`.
    fn read_at(&self, position: u64, buf: &mut [u8]) -> FileResult<()>;

    /// Append all buffers in order. Returns the position of the first byte written.
    fn append(&self, buffers: &[&[u8]]) -> FileResult<u64>;

    /// Cut the file down to `new_length` bytes.
    fn truncate(&self, new_length: u64) -> FileResult<()>;

    /// Close and remove the file. Returns `true` if it existed.
    fn delete(&self) -> FileResult<bool>;

    /// Release the lock and the OS handle.
    fn close(&self) -> FileResult<()>;

    /// Append `length` bytes starting at `position` of this file to `target`.
    ///
    /// Returns the number of bytes copied. The default implementation streams
    /// the range in [`COPY_CHUNK_SIZE`] chunks.
    fn copy_to(&self, target: &dyn FileBackend, position: u64, length: u64) -> FileResult<u64> {
        let file_length = self.size()?;
        if position.saturating_add(length) > file_length {
            return Err(FileError::ReadOutOfBounds {
                file: self.identifier().to_string(),
                position,
                length,
                file_length,
            });
        }

        let mut buf = vec![0u8; COPY_CHUNK_SIZE.min(length as usize)];
        let mut copied = 0u64;
        while copied < length {
            let chunk = (length - copied).min(buf.len() as u64) as usize;
            self.read_at(position + copied, &mut buf[..chunk])?;
            target.append(&[&buf[..chunk]])?;
            copied += chunk as u64;
        }
        Ok(copied)
    }
}

/// Read `length` bytes at `position` into a fresh buffer.
pub fn read_range(file: &dyn FileBackend, position: u64, length: u64) -> FileResult<Vec<u8>> {
    let mut buf = vec![0u8; length as usize];
    file.read_at(position, &mut buf)?;
    Ok(buf)
}
