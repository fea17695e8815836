use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use chanstore_file::FileHandle;
use chanstore_types::UserId;

use crate::error::BackupResult;

/// Shortest wait between two checks of an empty queue.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One pending mutation of a live file, to be replayed onto its backup.
pub enum BackupItem {
    /// Append `length` bytes starting at `position` of `file` to its backup.
    Copy {
        file: Arc<FileHandle>,
        position: u64,
        length: u64,
    },
    /// Cut the backup of `file` down to `new_length`.
    Truncate {
        file: Arc<FileHandle>,
        new_length: u64,
    },
    /// Remove the backup of `file`.
    Delete { file: Arc<FileHandle> },
}

impl BackupItem {
    pub fn file(&self) -> &FileHandle {
        match self {
            Self::Copy { file, .. } | Self::Truncate { file, .. } | Self::Delete { file } => file,
        }
    }
}

impl fmt::Debug for BackupItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy {
                file,
                position,
                length,
            } => write!(f, "Copy({}, {position}+{length})", file.identifier()),
            Self::Truncate { file, new_length } => {
                write!(f, "Truncate({}, {new_length})", file.identifier())
            }
            Self::Delete { file } => write!(f, "Delete({})", file.identifier()),
        }
    }
}

/// Consumer side of the backup queue: applies items to the backup file set.
pub trait BackupHandler {
    fn copy_file_part(&mut self, file: &FileHandle, position: u64, length: u64) -> BackupResult<()>;

    fn truncate_file(&mut self, file: &FileHandle, new_length: u64) -> BackupResult<()>;

    fn delete_file(&mut self, file: &FileHandle) -> BackupResult<()>;
}

/// FIFO of pending backup items.
///
/// Any number of channel threads enqueue; a single backup thread drains the
/// queue through [`process_next_item`](Self::process_next_item). Items are
/// applied strictly in enqueue order: a truncate or delete is only valid
/// once every earlier copy of the same file has captured its data.
///
/// A copy item holds a usage of its file under the queue's own [`UserId`], so
/// the file cannot be closed before the copy ran.
pub struct BackupItemQueue {
    items: Mutex<VecDeque<BackupItem>>,
    available: Condvar,
    user: UserId,
}

impl BackupItemQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            user: UserId::fresh(),
        }
    }

    /// The identity under which queued copies hold their files open.
    pub fn user(&self) -> UserId {
        self.user
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<BackupItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, item: BackupItem) {
        debug!(item = ?item, "backup item enqueued");
        self.items().push_back(item);
        self.available.notify_all();
    }

    pub fn enqueue_copying_item(&self, file: &Arc<FileHandle>, position: u64, length: u64) {
        file.register_usage(self.user);
        self.enqueue(BackupItem::Copy {
            file: Arc::clone(file),
            position,
            length,
        });
    }

    pub fn enqueue_truncating_item(&self, file: &Arc<FileHandle>, new_length: u64) {
        self.enqueue(BackupItem::Truncate {
            file: Arc::clone(file),
            new_length,
        });
    }

    pub fn enqueue_deletion_item(&self, file: &Arc<FileHandle>) {
        self.enqueue(BackupItem::Delete {
            file: Arc::clone(file),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// Wait up to `timeout` for the next item and apply it to `handler`.
    ///
    /// Returns `Ok(false)` if no item arrived in time. The wait is split into
    /// probes of `timeout / 16` (at least [`MIN_POLL_INTERVAL`]) so a missed
    /// notification delays processing by at most one probe.
    pub fn process_next_item(
        &self,
        handler: &mut dyn BackupHandler,
        timeout: Duration,
    ) -> BackupResult<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let probe = (timeout / 16).max(MIN_POLL_INTERVAL);

        let item = {
            let mut items = self.items();
            loop {
                if let Some(item) = items.pop_front() {
                    break item;
                }
                let wait = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(false);
                        }
                        probe.min(deadline - now)
                    }
                    None => probe,
                };
                items = self
                    .available
                    .wait_timeout(items, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        self.dispatch(handler, item)?;
        Ok(true)
    }

    fn dispatch(&self, handler: &mut dyn BackupHandler, item: BackupItem) -> BackupResult<()> {
        match item {
            BackupItem::Copy {
                file,
                position,
                length,
            } => {
                let copied = handler.copy_file_part(&file, position, length);
                // The usage is released even if the copy failed.
                let released = file.unregister_usage_closing(self.user, |_| Ok(()));
                copied?;
                if let Err(e) = released {
                    warn!(file = %file.identifier(), error = %e, "failed to release backup usage");
                    return Err(e.into());
                }
                Ok(())
            }
            BackupItem::Truncate { file, new_length } => handler.truncate_file(&file, new_length),
            BackupItem::Delete { file } => handler.delete_file(&file),
        }
    }
}

impl Default for BackupItemQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BackupItemQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupItemQueue")
            .field("len", &self.len())
            .field("user", &self.user)
            .finish()
    }
}
