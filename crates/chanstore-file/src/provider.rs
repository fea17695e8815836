use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chanstore_types::{ChannelIndex, FileNumber};

use crate::backend::FileBackend;
use crate::error::{FileError, FileResult};
use crate::local::LocalFile;
use crate::memory::MemoryFile;

const DATA_FILE_SUFFIX: &str = ".dat";

/// Name of the directory holding the files of `channel`.
pub fn channel_directory_name(channel: ChannelIndex) -> String {
    format!("channel_{}", channel.get())
}

/// Name of data file `number` of `channel`.
pub fn data_file_name(channel: ChannelIndex, number: FileNumber) -> String {
    format!("channel_{}_{}{}", channel.get(), number.get(), DATA_FILE_SUFFIX)
}

fn parse_data_file_name(channel: ChannelIndex, name: &str) -> Option<FileNumber> {
    let prefix = format!("channel_{}_", channel.get());
    name.strip_prefix(&prefix)?
        .strip_suffix(DATA_FILE_SUFFIX)?
        .parse()
        .ok()
        .map(FileNumber::new)
}

/// Creates and enumerates the data files of each channel.
pub trait FileProvider: Send + Sync + fmt::Debug {
    /// Backend for data file `number` of `channel`. The file need not exist yet.
    fn data_file(
        &self,
        channel: ChannelIndex,
        number: FileNumber,
    ) -> FileResult<Arc<dyn FileBackend>>;

    /// All existing data files of `channel`, ascending by number.
    fn existing_data_files(
        &self,
        channel: ChannelIndex,
    ) -> FileResult<Vec<(FileNumber, Arc<dyn FileBackend>)>>;
}

/// Data files under `<root>/channel_<i>/channel_<i>_<n>.dat`.
#[derive(Debug, Clone)]
pub struct LocalFileProvider {
    root: PathBuf,
}

impl LocalFileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn channel_directory(&self, channel: ChannelIndex) -> PathBuf {
        self.root.join(channel_directory_name(channel))
    }
}

impl FileProvider for LocalFileProvider {
    fn data_file(
        &self,
        channel: ChannelIndex,
        number: FileNumber,
    ) -> FileResult<Arc<dyn FileBackend>> {
        let path = self
            .channel_directory(channel)
            .join(data_file_name(channel, number));
        Ok(Arc::new(LocalFile::new(path)))
    }

    fn existing_data_files(
        &self,
        channel: ChannelIndex,
    ) -> FileResult<Vec<(FileNumber, Arc<dyn FileBackend>)>> {
        let directory = self.channel_directory(channel);
        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FileError::io(directory.display().to_string(), e)),
        };

        let mut files: Vec<(FileNumber, Arc<dyn FileBackend>)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FileError::io(directory.display().to_string(), e))?;
            let name = entry.file_name();
            let Some(number) = parse_data_file_name(channel, &name.to_string_lossy()) else {
                continue;
            };
            files.push((number, Arc::new(LocalFile::new(entry.path()))));
        }
        files.sort_by_key(|(number, _)| *number);
        Ok(files)
    }
}

/// Data files held in memory.
///
/// Files are retained by the provider, so a second storage system started on
/// the same provider sees the files written by the first one.
#[derive(Debug, Default)]
pub struct MemoryFileProvider {
    files: Mutex<BTreeMap<(ChannelIndex, FileNumber), Arc<MemoryFile>>>,
}

impl MemoryFileProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileProvider for MemoryFileProvider {
    fn data_file(
        &self,
        channel: ChannelIndex,
        number: FileNumber,
    ) -> FileResult<Arc<dyn FileBackend>> {
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        let file = files.entry((channel, number)).or_insert_with(|| {
            let identifier = format!(
                "mem/{}/{}",
                channel_directory_name(channel),
                data_file_name(channel, number)
            );
            Arc::new(MemoryFile::new(identifier))
        });
        Ok(Arc::clone(file) as Arc<dyn FileBackend>)
    }

    fn existing_data_files(
        &self,
        channel: ChannelIndex,
    ) -> FileResult<Vec<(FileNumber, Arc<dyn FileBackend>)>> {
        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        let mut existing = Vec::new();
        for ((file_channel, number), file) in files.iter() {
            if *file_channel == channel && file.exists()? {
                existing.push((*number, Arc::clone(file) as Arc<dyn FileBackend>));
            }
        }
        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_round_trip_through_parser() {
        let channel = ChannelIndex::new(3);
        let name = data_file_name(channel, FileNumber::new(12));
        assert_eq!(name, "channel_3_12.dat");
        assert_eq!(parse_data_file_name(channel, &name), Some(FileNumber::new(12)));
        assert_eq!(parse_data_file_name(ChannelIndex::new(1), &name), None);
        assert_eq!(parse_data_file_name(channel, "channel_3_x.dat"), None);
        assert_eq!(parse_data_file_name(channel, "channel_3_12.bak"), None);
    }

    #[test]
    fn local_provider_lists_existing_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalFileProvider::new(dir.path());
        let channel = ChannelIndex::new(0);
        assert!(provider.existing_data_files(channel).unwrap().is_empty());

        for n in [10u64, 2, 1] {
            let file = provider.data_file(channel, FileNumber::new(n)).unwrap();
            file.open().unwrap();
            file.close().unwrap();
        }
        fs::write(provider.channel_directory(channel).join("notes.txt"), b"x").unwrap();

        let numbers: Vec<u64> = provider
            .existing_data_files(channel)
            .unwrap()
            .into_iter()
            .map(|(n, _)| n.get())
            .collect();
        assert_eq!(numbers, vec![1, 2, 10]);
        assert!(provider.existing_data_files(ChannelIndex::new(1)).unwrap().is_empty());
    }

    #[test]
    fn memory_provider_keeps_files_and_skips_deleted() {
        let provider = MemoryFileProvider::new();
        let channel = ChannelIndex::new(1);

        let first = provider.data_file(channel, FileNumber::FIRST).unwrap();
        first.open().unwrap();
        first.append(&[b"abc"]).unwrap();
        let second = provider.data_file(channel, FileNumber::new(2)).unwrap();
        second.open().unwrap();
        second.delete().unwrap();
        // Never opened, so it does not exist.
        provider.data_file(channel, FileNumber::new(3)).unwrap();

        let existing = provider.existing_data_files(channel).unwrap();
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].0, FileNumber::FIRST);
        assert_eq!(existing[0].1.size().unwrap(), 3);
    }
}
