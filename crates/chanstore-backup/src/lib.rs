//! Backup replication for chanstore.
//!
//! Every mutation a channel performs on one of its live data files (append,
//! truncate, delete) is also recorded as a [`BackupItem`] on the shared
//! [`BackupItemQueue`]. A single backup thread drains the queue in FIFO order
//! and applies each item through a [`BackupHandler`]; the default
//! [`FileBackupHandler`] mirrors the files into a backup directory and
//! validates every copied range.

pub mod error;
pub mod handler;
pub mod queue;

pub use error::{BackupError, BackupResult};
pub use handler::{BackupConfig, FileBackupHandler};
pub use queue::{BackupHandler, BackupItem, BackupItemQueue, MIN_POLL_INTERVAL};
