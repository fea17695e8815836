use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::backend::FileBackend;
use crate::error::{FileError, FileResult};

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    exists: bool,
    open: bool,
}

/// In-memory [`FileBackend`].
///
/// Intended for tests and embedding. Contents survive `close` and are only
/// dropped by `delete`, so a storage system can be restarted on the same set
/// of memory files.
#[derive(Debug)]
pub struct MemoryFile {
    identifier: String,
    name: String,
    state: Mutex<MemoryState>,
}

impl MemoryFile {
    /// Create a file that does not exist yet. `open` creates it.
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let name = identifier
            .rsplit('/')
            .next()
            .unwrap_or(identifier.as_str())
            .to_string();
        Self {
            identifier,
            name,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Snapshot of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.state().data.clone()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_state(&self) -> FileResult<MutexGuard<'_, MemoryState>> {
        let state = self.state();
        if !state.open {
            return Err(FileError::Closed(self.identifier.clone()));
        }
        Ok(state)
    }
}

impl FileBackend for MemoryFile {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> FileResult<bool> {
        Ok(self.state().exists)
    }

    fn size(&self) -> FileResult<u64> {
        Ok(self.state().data.len() as u64)
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn open(&self) -> FileResult<()> {
        let mut state = self.state();
        state.exists = true;
        state.open = true;
        Ok(())
    }

    fn read_at(&self, position: u64, buf: &mut [u8]) -> FileResult<()> {
        let state = self.open_state()?;
        let file_length = state.data.len() as u64;
        let end = position.saturating_add(buf.len() as u64);
        if end > file_length {
            return Err(FileError::ReadOutOfBounds {
                file: self.identifier.clone(),
                position,
                length: buf.len() as u64,
                file_length,
            });
        }
        buf.copy_from_slice(&state.data[position as usize..end as usize]);
        Ok(())
    }

    fn append(&self, buffers: &[&[u8]]) -> FileResult<u64> {
        let mut state = self.open_state()?;
        let position = state.data.len() as u64;
        for buffer in buffers {
            state.data.extend_from_slice(buffer);
        }
        Ok(position)
    }

    fn truncate(&self, new_length: u64) -> FileResult<()> {
        let mut state = self.open_state()?;
        state.data.truncate(new_length as usize);
        Ok(())
    }

    fn delete(&self) -> FileResult<bool> {
        let mut state = self.state();
        let existed = state.exists;
        *state = MemoryState::default();
        Ok(existed)
    }

    fn close(&self) -> FileResult<()> {
        self.state().open = false;
        Ok(())
    }
}
