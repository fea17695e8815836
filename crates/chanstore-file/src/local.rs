use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::backend::FileBackend;
use crate::error::{FileError, FileResult};

/// A [`FileBackend`] on the local file system.
///
/// The OS handle is opened in append mode and held together with an
/// exclusive advisory lock (`flock` / `LockFileEx` via `fs2`) until
/// [`close`](FileBackend::close) is called.
#[derive(Debug)]
pub struct LocalFile {
    path: PathBuf,
    identifier: String,
    name: String,
    handle: Mutex<Option<File>>,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let identifier = path.display().to_string();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| identifier.clone());
        Self {
            path,
            identifier,
            name,
            handle: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> MutexGuard<'_, Option<File>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn io_err(&self, e: io::Error) -> FileError {
        FileError::io(self.identifier.clone(), e)
    }

    fn closed(&self) -> FileError {
        FileError::Closed(self.identifier.clone())
    }
}

impl FileBackend for LocalFile {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> FileResult<bool> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn size(&self) -> FileResult<u64> {
        if let Some(file) = self.handle().as_ref() {
            return file.metadata().map(|m| m.len()).map_err(|e| self.io_err(e));
        }
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn is_open(&self) -> bool {
        self.handle().is_some()
    }

    fn open(&self) -> FileResult<()> {
        let mut handle = self.handle();
        if handle.is_some() {
            return Ok(());
        }

        // Ensure parent directory exists.
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;

        if file.try_lock_exclusive().is_err() {
            return Err(FileError::Locked(self.identifier.clone()));
        }

        debug!(file = %self.identifier, "file opened");
        *handle = Some(file);
        Ok(())
    }

    fn read_at(&self, position: u64, buf: &mut [u8]) -> FileResult<()> {
        let handle = self.handle();
        let mut file = handle.as_ref().ok_or_else(|| self.closed())?;

        let file_length = file.metadata().map_err(|e| self.io_err(e))?.len();
        if position + buf.len() as u64 > file_length {
            return Err(FileError::ReadOutOfBounds {
                file: self.identifier.clone(),
                position,
                length: buf.len() as u64,
                file_length,
            });
        }

        file.seek(SeekFrom::Start(position))
            .map_err(|e| self.io_err(e))?;
        file.read_exact(buf).map_err(|e| self.io_err(e))
    }

    fn append(&self, buffers: &[&[u8]]) -> FileResult<u64> {
        let handle = self.handle();
        let mut file = handle.as_ref().ok_or_else(|| self.closed())?;

        let position = file.metadata().map_err(|e| self.io_err(e))?.len();
        for buffer in buffers {
            file.write_all(buffer).map_err(|e| self.io_err(e))?;
        }
        file.flush().map_err(|e| self.io_err(e))?;
        Ok(position)
    }

    fn truncate(&self, new_length: u64) -> FileResult<()> {
        let handle = self.handle();
        let file = handle.as_ref().ok_or_else(|| self.closed())?;
        file.set_len(new_length).map_err(|e| self.io_err(e))?;
        file.sync_all().map_err(|e| self.io_err(e))
    }

    fn delete(&self) -> FileResult<bool> {
        self.close()?;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(file = %self.identifier, "file deleted");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn close(&self) -> FileResult<()> {
        let mut handle = self.handle();
        if let Some(file) = handle.take() {
            if let Err(e) = file.sync_all() {
                warn!(file = %self.identifier, error = %e, "sync before close failed");
            }
            // Dropping the handle releases the lock as well; unlock explicitly
            // so a failure is reported instead of silently ignored.
            FileExt::unlock(&file).map_err(|e| self.io_err(e))?;
            debug!(file = %self.identifier, "file closed");
        }
        Ok(())
    }
}

impl Drop for LocalFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(file = %self.identifier, error = %e, "failed to close file on drop");
        }
    }
}
