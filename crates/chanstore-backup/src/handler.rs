use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use chanstore_file::{channel_directory_name, FileBackend, FileError, FileHandle, LocalFile};
use chanstore_types::ChannelIndex;

use crate::error::{BackupError, BackupResult};
use crate::queue::BackupHandler;

/// Chunk size for checksumming copied ranges.
const VALIDATION_CHUNK_SIZE: u64 = 64 * 1024;

/// Backup settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Root directory of the backup file set.
    pub directory: PathBuf,
    /// If set, deleted backup files are moved here instead of being removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_directory: Option<PathBuf>,
    /// How long the backup thread waits for an item before re-checking its state.
    pub poll_timeout_ms: u64,
    /// Verify every copied range by length and CRC32.
    pub validate_copies: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("backup"),
            deletion_directory: None,
            poll_timeout_ms: 250,
            validate_copies: true,
        }
    }
}

/// [`BackupHandler`] mirroring every live file to
/// `<directory>/channel_<i>/<file name>`.
///
/// Copies are self-healing: a backup file shorter than the copy position is
/// first brought up to date from the live file, and bytes the backup already
/// holds are not copied again. A backup file longer than the end of the copied
/// range means the backup is ahead of the live file, which is an error.
///
/// A backup file is checked when first opened: the bytes it already holds
/// must equal the live file's leading bytes, else it is stale and every
/// operation on it fails with [`BackupError::StaleBackup`].
#[derive(Debug)]
pub struct FileBackupHandler {
    config: BackupConfig,
    targets: HashMap<(ChannelIndex, String), Arc<LocalFile>>,
}

impl FileBackupHandler {
    pub fn new(config: BackupConfig) -> Self {
        info!(directory = %config.directory.display(), "backup handler created");
        Self {
            config,
            targets: HashMap::new(),
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Path of the backup of `file`.
    pub fn backup_path(&self, file: &FileHandle) -> PathBuf {
        self.config
            .directory
            .join(channel_directory_name(file.channel()))
            .join(file.name())
    }

    fn target(&mut self, file: &FileHandle) -> BackupResult<Arc<LocalFile>> {
        let key = (file.channel(), file.name().to_string());
        if let Some(target) = self.targets.get(&key) {
            return Ok(Arc::clone(target));
        }
        let target = Arc::new(LocalFile::new(self.backup_path(file)));
        target.open()?;
        if let Err(e) = verify_existing_backup(file, target.as_ref()) {
            if let Err(close) = target.close() {
                warn!(
                    file = %target.identifier(),
                    error = %close,
                    "failed to close rejected backup file",
                );
            }
            return Err(e);
        }
        self.targets.insert(key, Arc::clone(&target));
        Ok(target)
    }

    fn forget_target(&mut self, file: &FileHandle) -> BackupResult<()> {
        if let Some(target) = self.targets.remove(&(file.channel(), file.name().to_string())) {
            target.close()?;
        }
        Ok(())
    }

    fn try_copy(&mut self, file: &FileHandle, position: u64, length: u64) -> BackupResult<()> {
        let target = self.target(file)?;
        let end = position + length;
        let backup_length = target.size()?;

        if backup_length > end {
            return Err(BackupError::BackupAhead {
                file: file.identifier().to_string(),
                backup_length,
                expected_length: end,
            });
        }
        if backup_length == end {
            return Ok(());
        }
        if backup_length < position {
            debug!(
                file = %file.identifier(),
                from = backup_length,
                to = position,
                "catching up lagging backup file"
            );
        }

        // Everything from the current backup length up to the end of the range.
        let copy_length = end - backup_length;
        file.copy_to(target.as_ref(), backup_length, copy_length)?;

        if self.config.validate_copies {
            validate_copy(file, target.as_ref(), backup_length, copy_length)?;
        }
        Ok(())
    }

    fn move_to_deletion_directory(
        &self,
        source: &Path,
        deletion_directory: &Path,
        file: &FileHandle,
    ) -> BackupResult<()> {
        let target_directory = deletion_directory.join(channel_directory_name(file.channel()));
        fs::create_dir_all(&target_directory).map_err(|e| BackupError::io(&target_directory, e))?;
        let target = target_directory.join(file.name());
        fs::rename(source, &target).map_err(|e| BackupError::io(source, e))?;
        debug!(
            file = %file.identifier(),
            target = %target.display(),
            "backup file moved to deletion directory",
        );
        Ok(())
    }

    /// Close every open backup file.
    pub fn close_all(&mut self) -> BackupResult<()> {
        let mut first_error = None;
        for (_, target) in self.targets.drain() {
            if let Err(e) = target.close() {
                warn!(file = %target.identifier(), error = %e, "failed to close backup file");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl BackupHandler for FileBackupHandler {
    fn copy_file_part(
        &mut self,
        file: &FileHandle,
        position: u64,
        length: u64,
    ) -> BackupResult<()> {
        self.try_copy(file, position, length)
            .map_err(|source| BackupError::Copying {
                file: file.identifier().to_string(),
                position,
                length,
                source: Box::new(source),
            })
    }

    fn truncate_file(&mut self, file: &FileHandle, new_length: u64) -> BackupResult<()> {
        let target = self.target(file)?;
        // A backup that never received the truncated bytes has nothing to cut.
        if target.size()? > new_length {
            target.truncate(new_length)?;
            debug!(file = %file.identifier(), new_length, "backup file truncated");
        }
        Ok(())
    }

    fn delete_file(&mut self, file: &FileHandle) -> BackupResult<()> {
        self.forget_target(file)?;
        let path = self.backup_path(file);
        if !path.exists() {
            return Ok(());
        }
        match self.config.deletion_directory.clone() {
            Some(deletion_directory) => self.move_to_deletion_directory(
                &path,
                &deletion_directory,
                file,
            ),
            None => {
                LocalFile::new(&path).delete()?;
                debug!(file = %file.identifier(), "backup file deleted");
                Ok(())
            }
        }
    }
}

impl Drop for FileBackupHandler {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            warn!(error = %e, "failed to close backup files on drop");
        }
    }
}

/// Check that the bytes `target` already holds are the leading bytes of `source`.
///
/// Only the overlap is compared; a backup longer than the live file is left
/// to the caller, which either truncates it or reports it as ahead.
fn verify_existing_backup(source: &FileHandle, target: &dyn FileBackend) -> BackupResult<()> {
    let length = target.size()?.min(source.size()?);
    if length == 0 {
        return Ok(());
    }
    let source_crc = range_checksum(|pos, buf| source.read_at(pos, buf), 0, length)?;
    let target_crc = range_checksum(|pos, buf| target.read_at(pos, buf), 0, length)?;
    if source_crc != target_crc {
        return Err(BackupError::StaleBackup {
            file: target.identifier().to_string(),
            length,
        });
    }
    debug!(file = %source.identifier(), length, "existing backup file verified");
    Ok(())
}

/// Check that `target` ends with exactly the `length` bytes of `source` at `position`.
fn validate_copy(
    source: &FileHandle,
    target: &dyn FileBackend,
    position: u64,
    length: u64,
) -> BackupResult<()> {
    let expected = position + length;
    let actual = target.size()?;
    if actual != expected {
        return Err(BackupError::LengthMismatch {
            file: target.identifier().to_string(),
            expected,
            actual,
        });
    }

    let source_crc = range_checksum(|pos, buf| source.read_at(pos, buf), position, length)?;
    let target_crc = range_checksum(|pos, buf| target.read_at(pos, buf), position, length)?;
    if source_crc != target_crc {
        return Err(BackupError::ChecksumMismatch {
            file: target.identifier().to_string(),
            position,
            length,
        });
    }
    Ok(())
}

fn range_checksum<F>(mut read_at: F, position: u64, length: u64) -> Result<u32, FileError>
where
    F: FnMut(u64, &mut [u8]) -> Result<(), FileError>,
{
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; VALIDATION_CHUNK_SIZE.min(length) as usize];
    let mut done = 0u64;
    while done < length {
        let chunk = (length - done).min(VALIDATION_CHUNK_SIZE) as usize;
        read_at(position + done, &mut buf[..chunk])?;
        hasher.update(&buf[..chunk]);
        done += chunk as u64;
    }
    Ok(hasher.finalize())
}
