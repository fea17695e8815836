use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use chanstore_types::{ChannelIndex, FileNumber, UserId};

use crate::backend::FileBackend;
use crate::error::{FileError, FileResult};
use crate::usage::UsageMap;

/// Reference-counted handle around one channel data file.
///
/// Several logical users (the owning channel, the backup thread, exporters)
/// can hold a claim on the same file. The usage registry only tracks those
/// claims; it never blocks on I/O. The physical file may be closed only while
/// no user is registered.
///
/// All usage operations are serialized on one per-file lock, so compound
/// operations like [`unregister_usage_closing`](Self::unregister_usage_closing)
/// and [`execute_if_unused`](Self::execute_if_unused) are atomic with respect
/// to concurrent registrations.
pub struct FileHandle {
    channel: ChannelIndex,
    number: FileNumber,
    backend: Arc<dyn FileBackend>,
    usages: Mutex<UsageMap>,
}

impl FileHandle {
    pub fn new(channel: ChannelIndex, number: FileNumber, backend: Arc<dyn FileBackend>) -> Self {
        Self {
            channel,
            number,
            backend,
            usages: Mutex::new(UsageMap::new()),
        }
    }

    pub fn channel(&self) -> ChannelIndex {
        self.channel
    }

    pub fn number(&self) -> FileNumber {
        self.number
    }

    pub fn backend(&self) -> &dyn FileBackend {
        self.backend.as_ref()
    }

    pub fn identifier(&self) -> &str {
        self.backend.identifier()
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    fn usages(&self) -> MutexGuard<'_, UsageMap> {
        self.usages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- usage registry ------------------------------------------------------

    /// Register one use by `user`. Returns `true` on the user's 0 -> 1 transition.
    pub fn register_usage(&self, user: UserId) -> bool {
        self.usages().increment(user)
    }

    /// Remove one use by `user`. Returns `true` on the user's 1 -> 0 transition.
    ///
    /// Fails with [`FileError::UserNotFound`] if `user` holds no use.
    pub fn unregister_usage(&self, user: UserId) -> FileResult<bool> {
        let mut usages = self.usages();
        self.decrement(&mut usages, user)
    }

    /// Remove one use by `user` and, if that left the file without any user,
    /// run `closing_action` on the backend and close it.
    ///
    /// Returns `true` if the file was closed. The whole operation holds the
    /// usage lock, so no other user can register between the last release
    /// and the close.
    pub fn unregister_usage_closing<F>(&self, user: UserId, closing_action: F) -> FileResult<bool>
    where
        F: FnOnce(&dyn FileBackend) -> FileResult<()>,
    {
        let mut usages = self.usages();
        if !self.decrement(&mut usages, user)? || !usages.is_empty() {
            return Ok(false);
        }
        closing_action(self.backend.as_ref())?;
        self.backend.close()?;
        debug!(file = %self.identifier(), "last user released, file closed");
        Ok(true)
    }

    /// Drop every use held by `user`. Returns whether `user` held any.
    pub fn clear_usages(&self, user: UserId) -> bool {
        self.usages().remove(user) > 0
    }

    pub fn has_users(&self) -> bool {
        !self.usages().is_empty()
    }

    pub fn is_used_by(&self, user: UserId) -> bool {
        self.usages().contains(user)
    }

    /// Number of distinct users.
    pub fn user_count(&self) -> usize {
        self.usages().len()
    }

    /// Run `action` only if the file has no users, atomically with the check.
    ///
    /// Returns `Ok(None)` without running the action when a user is registered.
    pub fn execute_if_unused<T, F>(&self, action: F) -> FileResult<Option<T>>
    where
        F: FnOnce(&dyn FileBackend) -> FileResult<T>,
    {
        let usages = self.usages();
        if !usages.is_empty() {
            return Ok(None);
        }
        action(self.backend.as_ref()).map(Some)
    }

    fn decrement(&self, usages: &mut UsageMap, user: UserId) -> FileResult<bool> {
        usages.decrement(user).ok_or_else(|| FileError::UserNotFound {
            file: self.identifier().to_string(),
            user,
        })
    }

    // -- file operations -----------------------------------------------------

    pub fn open(&self) -> FileResult<()> {
        self.backend.open()
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_open()
    }

    /// Close the file. Fails with [`FileError::InUse`] while users are registered.
    pub fn close(&self) -> FileResult<()> {
        let usages = self.usages();
        if !usages.is_empty() {
            return Err(FileError::InUse {
                file: self.identifier().to_string(),
                users: usages.len(),
            });
        }
        self.backend.close()
    }

    /// Close the file if it has no users. Returns whether it was closed.
    pub fn try_close(&self) -> FileResult<bool> {
        let usages = self.usages();
        if !usages.is_empty() {
            return Ok(false);
        }
        self.backend.close()?;
        Ok(true)
    }

    pub fn exists(&self) -> FileResult<bool> {
        self.backend.exists()
    }

    pub fn size(&self) -> FileResult<u64> {
        self.backend.size()
    }

    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> FileResult<()> {
        self.backend.read_at(position, buf)
    }

    pub fn append(&self, buffers: &[&[u8]]) -> FileResult<u64> {
        self.backend.append(buffers)
    }

    pub fn truncate(&self, new_length: u64) -> FileResult<()> {
        self.backend.truncate(new_length)
    }

    /// Copy a byte range of this file onto the end of `target`.
    pub fn copy_to(&self, target: &dyn FileBackend, position: u64, length: u64) -> FileResult<u64> {
        self.backend.copy_to(target, position, length)
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("channel", &self.channel)
            .field("number", &self.number)
            .field("file", &self.identifier())
            .field("users", &self.user_count())
            .finish()
    }
}
