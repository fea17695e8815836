use std::io;
use std::path::PathBuf;

use chanstore_file::FileError;

/// Errors raised while replicating channel files onto the backup set.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Error from a live or backup file.
    #[error(transparent)]
    File(#[from] FileError),

    /// Directory-level I/O error (creating or moving backup files).
    #[error("backup I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Copying a range of a live file onto its backup failed.
    #[error("copying {length} bytes at {position} of {file} to backup failed: {source}")]
    Copying {
        file: String,
        position: u64,
        length: u64,
        #[source]
        source: Box<BackupError>,
    },

    /// The backup file did not grow by the copied length.
    #[error("backup of {file} has length {actual}, expected {expected}")]
    LengthMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    /// The copied bytes differ from the source range.
    #[error("backup of {file} differs from the source at range {position}+{length}")]
    ChecksumMismatch {
        file: String,
        position: u64,
        length: u64,
    },

    /// A backup file found on first use does not hold the live file's leading bytes.
    #[error("existing backup of {file} does not match the first {length} bytes of the live file")]
    StaleBackup { file: String, length: u64 },

    /// The backup file already holds more data than the live file at the copy position.
    #[error("backup of {file} is ahead of the live file ({backup_length} > {expected_length})")]
    BackupAhead {
        file: String,
        backup_length: u64,
        expected_length: u64,
    },
}

impl BackupError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;
