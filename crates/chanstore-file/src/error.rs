use std::io;

use chanstore_types::UserId;

/// Errors from file handles, backends and file policy construction.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    /// I/O error from the underlying file system.
    #[error("I/O error on {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: io::Error,
    },

    /// An operation that needs an open file was called on a closed one.
    #[error("file {0} is not open")]
    Closed(String),

    /// Another process holds the exclusive lock on the file.
    #[error("file {0} is locked by another process")]
    Locked(String),

    /// The file does not exist.
    #[error("file {0} does not exist")]
    NotFound(String),

    /// A read reached past the end of the file.
    #[error("read of {length} bytes at {position} exceeds length {file_length} of {file}")]
    ReadOutOfBounds {
        file: String,
        position: u64,
        length: u64,
        file_length: u64,
    },

    /// Unregistering a user that holds no usage of the file.
    #[error("file user {user} not found on {file}")]
    UserNotFound { file: String, user: UserId },

    /// Closing a file that still has registered users.
    #[error("file {file} is still in use by {users} user(s)")]
    InUse { file: String, users: usize },

    /// Policy parameters are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl FileError {
    /// Wrap an I/O error with the identifier of the file it occurred on.
    pub fn io(file: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            file: file.into(),
            source,
        }
    }
}

/// Result alias for file operations.
pub type FileResult<T> = Result<T, FileError>;
