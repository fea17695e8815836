use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use chanstore_backup::BackupItemQueue;
use chanstore_file::{
    channel_directory_name, DataFileEvaluator, DataFileStats, FileBackend, FileHandle, FileProvider,
    LocalFile,
};
use chanstore_types::{ChannelIndex, Deadline, EntityId, FileNumber, TaskTimestamp, UserId};

use crate::cache::{EntityCache, EntityLocation, GcOutcome};
use crate::error::{EngineError, EngineResult};
use crate::record::{encode_record, read_payload, read_raw, scan_records, RecordKind};

/// Dissolved files that were still in use when their channel shut down.
///
/// The storage system deletes them once their last user, typically the
/// backup thread, let go.
#[derive(Debug, Default)]
pub struct DeferredDeletions {
    files: Mutex<Vec<Arc<FileHandle>>>,
}

impl DeferredDeletions {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, Vec<Arc<FileHandle>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }

    fn hand_over(&self, handles: Vec<Arc<FileHandle>>) {
        self.files().extend(handles);
    }

    /// Delete every file nobody uses anymore. Returns how many remain.
    pub fn delete_unused(&self) -> EngineResult<usize> {
        let mut files = self.files();
        let mut remaining = Vec::new();
        for handle in files.drain(..) {
            match handle.execute_if_unused(|backend| backend.delete())? {
                Some(_) => debug!(file = %handle.identifier(), "deferred deletion done"),
                None => remaining.push(handle),
            }
        }
        *files = remaining;
        Ok(files.len())
    }
}

#[derive(Debug)]
struct DataFile {
    handle: Arc<FileHandle>,
    total_length: u64,
    data_length: u64,
    live_records: usize,
}

impl DataFile {
    fn new(handle: Arc<FileHandle>, total_length: u64) -> Self {
        Self {
            handle,
            total_length,
            data_length: 0,
            live_records: 0,
        }
    }
}

/// What a channel found in its data files on startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StorageInventory {
    /// Highest record timestamp found, [`TaskTimestamp::ZERO`] if none.
    pub latest_timestamp: TaskTimestamp,
    pub file_count: usize,
    pub record_count: usize,
    /// Bytes cut off torn file tails.
    pub truncated_bytes: u64,
}

/// A data file copied by an export.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExportedFile {
    pub channel: ChannelIndex,
    pub name: String,
    pub length: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileStatistics {
    pub number: FileNumber,
    pub total_length: u64,
    pub data_length: u64,
    pub live_records: usize,
    pub fill_ratio: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelStatistics {
    pub channel: ChannelIndex,
    pub head_file: FileNumber,
    pub entity_count: usize,
    pub cached_bytes: u64,
    pub pending_deletes: usize,
    pub files: Vec<FileStatistics>,
}

impl ChannelStatistics {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.total_length).sum()
    }

    pub fn data_length(&self) -> u64 {
        self.files.iter().map(|f| f.data_length).sum()
    }
}

/// The data files of one channel.
///
/// Records are only ever appended to the head file, the highest-numbered
/// one. Every record superseded in the entity cache becomes a gap in its
/// file; files the evaluator picks are dissolved by copying their live
/// records to the head and deleting them. The channel holds one usage on
/// each file it owns, and every appended range is forwarded to the backup
/// queue when one is attached.
#[derive(Debug)]
pub struct ChannelFileManager {
    channel: ChannelIndex,
    user: UserId,
    provider: Arc<dyn FileProvider>,
    evaluator: DataFileEvaluator,
    backup: Option<Arc<BackupItemQueue>>,
    files: BTreeMap<FileNumber, DataFile>,
    head: FileNumber,
    pending_deletes: Vec<Arc<FileHandle>>,
    deferred: Option<Arc<DeferredDeletions>>,
    initialized: bool,
}

impl ChannelFileManager {
    pub fn new(
        channel: ChannelIndex,
        provider: Arc<dyn FileProvider>,
        evaluator: DataFileEvaluator,
        backup: Option<Arc<BackupItemQueue>>,
    ) -> Self {
        Self {
            channel,
            user: UserId::fresh(),
            provider,
            evaluator,
            backup,
            files: BTreeMap::new(),
            head: FileNumber::FIRST,
            pending_deletes: Vec::new(),
            deferred: None,
            initialized: false,
        }
    }

    /// Hand files still in use at shutdown to `deferred` instead of leaving them behind.
    pub fn with_deferred_deletions(mut self, deferred: Arc<DeferredDeletions>) -> Self {
        self.deferred = Some(deferred);
        self
    }

    pub fn channel(&self) -> ChannelIndex {
        self.channel
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn head_file(&self) -> FileNumber {
        self.head
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn file(&self, number: FileNumber) -> EngineResult<&DataFile> {
        self.files.get(&number).ok_or(EngineError::UnknownFile {
            channel: self.channel,
            number: number.get(),
        })
    }

    // -- startup -------------------------------------------------------------

    /// Open every data file of the channel and rebuild `cache` from them.
    ///
    /// A torn or corrupt file tail is cut off. Without any data file a first
    /// empty head file is created.
    pub fn initialize_storage(
        &mut self,
        cache: &mut dyn EntityCache,
    ) -> EngineResult<StorageInventory> {
        cache.reset();
        self.files.clear();
        let mut inventory = StorageInventory::default();

        for (number, backend) in self.provider.existing_data_files(self.channel)? {
            let handle = Arc::new(FileHandle::new(self.channel, number, backend));
            handle.open()?;
            handle.register_usage(self.user);

            let outcome = scan_records(&handle)?;
            let size = handle.size()?;
            if outcome.valid_length < size {
                warn!(
                    channel = self.channel.get(),
                    file = %handle.identifier(),
                    size,
                    valid_length = outcome.valid_length,
                    "truncating torn file tail"
                );
                handle.truncate(outcome.valid_length)?;
                if let Some(backup) = &self.backup {
                    backup.enqueue_truncating_item(&handle, outcome.valid_length);
                }
                inventory.truncated_bytes += size - outcome.valid_length;
            }

            self.files
                .insert(number, DataFile::new(Arc::clone(&handle), outcome.valid_length));
            self.head = number;
            for record in &outcome.records {
                inventory.latest_timestamp = inventory.latest_timestamp.max(record.timestamp);
                let location = EntityLocation {
                    file: number,
                    position: record.position,
                    length: record.length,
                };
                self.register_record(cache, record.entity, record.kind, location);
            }
            inventory.record_count += outcome.records.len();
        }

        if self.files.is_empty() {
            self.create_file(FileNumber::FIRST)?;
        } else {
            self.retire_head_if_full()?;
        }

        // Bring the backup in line with whatever survived the restart.
        if let Some(backup) = &self.backup {
            for file in self.files.values().filter(|f| f.total_length > 0) {
                backup.enqueue_copying_item(&file.handle, 0, file.total_length);
            }
        }

        inventory.file_count = self.files.len();
        self.initialized = true;
        info!(
            channel = self.channel.get(),
            files = inventory.file_count,
            records = inventory.record_count,
            entities = cache.entity_count(),
            "channel storage initialized"
        );
        Ok(inventory)
    }

    fn create_file(&mut self, number: FileNumber) -> EngineResult<()> {
        let backend = self.provider.data_file(self.channel, number)?;
        let handle = Arc::new(FileHandle::new(self.channel, number, backend));
        handle.open()?;
        handle.register_usage(self.user);
        let size = handle.size()?;
        // Lets the backup reject a leftover file of the same name.
        if let Some(backup) = &self.backup {
            backup.enqueue_copying_item(&handle, 0, size);
        }
        self.files.insert(number, DataFile::new(handle, size));
        self.head = number;
        debug!(channel = self.channel.get(), file = %number, "new head file");
        Ok(())
    }

    fn retire_head_if_full(&mut self) -> EngineResult<()> {
        let head = self.file(self.head)?;
        if self.evaluator.needs_retirement(head.total_length) {
            self.create_file(self.head.next())?;
        }
        Ok(())
    }

    // -- record accounting ---------------------------------------------------

    fn register_record(
        &mut self,
        cache: &mut dyn EntityCache,
        entity: EntityId,
        kind: RecordKind,
        location: EntityLocation,
    ) {
        let superseded = cache.register(entity, kind, location);
        self.account_added(location);
        if let Some(old) = superseded {
            self.account_removed(old);
        }
    }

    fn account_added(&mut self, location: EntityLocation) {
        if let Some(file) = self.files.get_mut(&location.file) {
            file.data_length += location.length;
            file.live_records += 1;
        }
    }

    fn account_removed(&mut self, location: EntityLocation) {
        if let Some(file) = self.files.get_mut(&location.file) {
            file.data_length = file.data_length.saturating_sub(location.length);
            file.live_records = file.live_records.saturating_sub(1);
        }
    }

    /// Append pre-encoded records to the head file in one write.
    ///
    /// Returns the head file number and the position of the first record.
    fn append_to_head(&mut self, records: &[Vec<u8>]) -> EngineResult<(FileNumber, u64)> {
        let number = self.head;
        let file = self.files.get_mut(&number).ok_or(EngineError::UnknownFile {
            channel: self.channel,
            number: number.get(),
        })?;
        let buffers: Vec<&[u8]> = records.iter().map(Vec::as_slice).collect();
        let length: u64 = records.iter().map(|r| r.len() as u64).sum();
        let position = file.handle.append(&buffers)?;
        file.total_length = position + length;
        if let Some(backup) = &self.backup {
            backup.enqueue_copying_item(&file.handle, position, length);
        }
        Ok((number, position))
    }

    // -- operations ----------------------------------------------------------

    /// Append one record per entity and make them current.
    ///
    /// Returns the number of bytes written.
    pub fn store(
        &mut self,
        cache: &mut dyn EntityCache,
        timestamp: TaskTimestamp,
        entities: &[(EntityId, Vec<u8>)],
    ) -> EngineResult<u64> {
        if entities.is_empty() {
            return Ok(0);
        }
        let records = entities
            .iter()
            .map(|(entity, payload)| encode_record(*entity, timestamp, RecordKind::Entity, payload))
            .collect::<EngineResult<Vec<_>>>()?;
        let (file, mut position) = self.append_to_head(&records)?;

        let mut written = 0;
        for ((entity, payload), record) in entities.iter().zip(&records) {
            let length = record.len() as u64;
            let location = EntityLocation {
                file,
                position,
                length,
            };
            self.register_record(cache, *entity, RecordKind::Entity, location);
            cache.cache_data(*entity, Arc::from(payload.as_slice()));
            position += length;
            written += length;
        }
        self.retire_head_if_full()?;
        Ok(written)
    }

    /// Payload of a live entity, from the cache or its data file.
    pub fn load(
        &self,
        cache: &mut dyn EntityCache,
        entity: EntityId,
    ) -> EngineResult<Option<Arc<[u8]>>> {
        if let Some(data) = cache.cached_data(entity) {
            return Ok(Some(data));
        }
        let Some(location) = cache.locate(entity) else {
            return Ok(None);
        };
        let file = self.file(location.file)?;
        let data: Arc<[u8]> = Arc::from(read_payload(
            &file.handle,
            location.position,
            location.length,
        )?);
        cache.cache_data(entity, Arc::clone(&data));
        Ok(Some(data))
    }

    /// Sweep released entities within `deadline` and persist a tombstone for
    /// each one swept.
    pub fn collect_garbage(
        &mut self,
        cache: &mut dyn EntityCache,
        timestamp: TaskTimestamp,
        deadline: Deadline,
    ) -> EngineResult<GcOutcome> {
        let outcome = cache.collect_garbage(deadline);
        if outcome.swept.is_empty() {
            return Ok(outcome);
        }
        let records = outcome
            .swept
            .iter()
            .map(|entity| encode_record(*entity, timestamp, RecordKind::Tombstone, &[]))
            .collect::<EngineResult<Vec<_>>>()?;
        let (file, mut position) = self.append_to_head(&records)?;
        for (entity, record) in outcome.swept.iter().zip(&records) {
            let length = record.len() as u64;
            let location = EntityLocation {
                file,
                position,
                length,
            };
            self.register_record(cache, *entity, RecordKind::Tombstone, location);
            position += length;
        }
        self.retire_head_if_full()?;
        debug!(channel = self.channel.get(), swept = outcome.swept.len(), "garbage swept");
        Ok(outcome)
    }

    fn stats(&self, number: FileNumber, file: &DataFile) -> DataFileStats {
        DataFileStats {
            total_length: file.total_length,
            data_length: file.data_length,
            is_head_file: number == self.head,
            has_single_entity: file.live_records == 1,
        }
    }

    /// Dissolve the files the evaluator picks, oldest first, until `deadline`.
    ///
    /// Returns whether every file was checked.
    pub fn check_files(
        &mut self,
        cache: &mut dyn EntityCache,
        deadline: Deadline,
    ) -> EngineResult<bool> {
        self.retry_pending_deletes()?;

        let candidates: Vec<FileNumber> = self
            .files
            .iter()
            .filter(|(number, file)| self.evaluator.needs_dissolving(&self.stats(**number, file)))
            .map(|(number, _)| *number)
            .collect();

        for number in candidates {
            if deadline.is_expired() {
                return Ok(false);
            }
            self.dissolve(cache, number)?;
        }
        Ok(true)
    }

    fn dissolve(&mut self, cache: &mut dyn EntityCache, number: FileNumber) -> EngineResult<()> {
        if number == self.head {
            self.create_file(self.head.next())?;
        }
        let source = Arc::clone(&self.file(number)?.handle);
        let live = cache.live_records(number);

        if !live.is_empty() {
            let records = live
                .iter()
                .map(|r| read_raw(&source, r.location.position, r.location.length))
                .collect::<EngineResult<Vec<_>>>()?;
            let (file, mut position) = self.append_to_head(&records)?;
            for record in &live {
                let location = EntityLocation {
                    file,
                    position,
                    length: record.location.length,
                };
                if let Some(old) = cache.relocate(record.entity, location) {
                    self.account_removed(old);
                }
                self.account_added(location);
                position += record.location.length;
            }
            self.retire_head_if_full()?;
        }

        self.files.remove(&number);
        if let Some(backup) = &self.backup {
            backup.enqueue_deletion_item(&source);
        }
        let deleted = source.unregister_usage_closing(
            self.user,
            |backend| backend.delete().map(drop),
        )?;
        if !deleted {
            debug!(
                file = %source.identifier(),
                users = source.user_count(),
                "file still in use, deletion deferred",
            );
            self.pending_deletes.push(Arc::clone(&source));
        }
        info!(
            channel = self.channel.get(),
            file = %number,
            moved = live.len(),
            deferred = !deleted,
            "data file dissolved"
        );
        Ok(())
    }

    fn retry_pending_deletes(&mut self) -> EngineResult<()> {
        let mut still_pending = Vec::new();
        for handle in self.pending_deletes.drain(..) {
            match handle.execute_if_unused(|backend| backend.delete())? {
                Some(_) => debug!(file = %handle.identifier(), "deferred deletion done"),
                None => still_pending.push(handle),
            }
        }
        self.pending_deletes = still_pending;
        Ok(())
    }

    /// Copy every data file into `target/channel_<i>/`.
    pub fn export(&self, target: &Path) -> EngineResult<Vec<ExportedFile>> {
        let exporter = UserId::fresh();
        let directory = target.join(channel_directory_name(self.channel));
        let mut exported = Vec::with_capacity(self.files.len());

        for file in self.files.values() {
            file.handle.register_usage(exporter);
            let copied = Self::export_file(&file.handle, &directory, file.total_length);
            file.handle.unregister_usage(exporter)?;
            exported.push(ExportedFile {
                channel: self.channel,
                name: file.handle.name().to_string(),
                length: copied?,
            });
        }
        debug!(channel = self.channel.get(), files = exported.len(), "channel exported");
        Ok(exported)
    }

    fn export_file(source: &FileHandle, directory: &Path, length: u64) -> EngineResult<u64> {
        let target = LocalFile::new(directory.join(source.name()));
        target.open()?;
        target.truncate(0)?;
        let copied = source.copy_to(&target, 0, length);
        target.close()?;
        Ok(copied?)
    }

    pub fn statistics(&self, cache: &dyn EntityCache) -> ChannelStatistics {
        ChannelStatistics {
            channel: self.channel,
            head_file: self.head,
            entity_count: cache.entity_count(),
            cached_bytes: cache.cached_bytes(),
            pending_deletes: self.pending_deletes.len(),
            files: self
                .files
                .iter()
                .map(|(number, file)| FileStatistics {
                    number: *number,
                    total_length: file.total_length,
                    data_length: file.data_length,
                    live_records: file.live_records,
                    fill_ratio: self.stats(*number, file).fill_ratio(),
                })
                .collect(),
        }
    }

    // -- shutdown ------------------------------------------------------------

    /// Release the channel's usage of every file. Files no one else uses are closed.
    pub fn shut_down(&mut self) -> EngineResult<()> {
        self.retry_pending_deletes()?;
        let pending = std::mem::take(&mut self.pending_deletes);
        if !pending.is_empty() {
            match &self.deferred {
                Some(deferred) => {
                    debug!(
                        channel = self.channel.get(),
                        files = pending.len(),
                        "deletions handed over",
                    );
                    deferred.hand_over(pending);
                }
                None => warn!(
                    channel = self.channel.get(),
                    files = pending.len(),
                    "files still in use at shutdown; not deleted"
                ),
            }
        }
        for file in std::mem::take(&mut self.files).into_values() {
            file.handle.unregister_usage_closing(self.user, |_| Ok(()))?;
        }
        self.initialized = false;
        Ok(())
    }

    /// [`shut_down`](Self::shut_down) for abnormal exits: logs instead of failing.
    pub fn release_files(&mut self) {
        if let Err(e) = self.shut_down() {
            warn!(channel = self.channel.get(), error = %e, "releasing files failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryEntityCache;
    use chanstore_file::{DataFileEvaluatorConfig, MemoryFileProvider};

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn evaluator(min: u64, max: u64, ratio: f64) -> DataFileEvaluator {
        DataFileEvaluator::new(DataFileEvaluatorConfig {
            minimum_file_size: min,
            maximum_file_size: max,
            minimum_use_ratio: ratio,
            clean_up_head_file: true,
        })
        .unwrap()
    }

    fn manager(
        provider: &Arc<MemoryFileProvider>,
        evaluator: DataFileEvaluator,
    ) -> ChannelFileManager {
        let provider: Arc<dyn FileProvider> = provider.clone();
        ChannelFileManager::new(ChannelIndex::new(0), provider, evaluator, None)
    }

    fn cache() -> InMemoryEntityCache {
        InMemoryEntityCache::new(1 << 20)
    }

    fn id(n: u64) -> EntityId {
        EntityId::new(n)
    }

    fn ts(n: u64) -> TaskTimestamp {
        TaskTimestamp::new(n)
    }

    fn payload(n: u64, len: usize) -> Vec<u8> {
        vec![n as u8; len]
    }

    // =========================================================================
    // Startup
    // =========================================================================

    #[test]
    fn empty_channel_creates_first_head_file() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut files = manager(&provider, DataFileEvaluator::default());
        let mut cache = cache();

        let inventory = files.initialize_storage(&mut cache).unwrap();
        assert_eq!(inventory.file_count, 1);
        assert_eq!(inventory.latest_timestamp, TaskTimestamp::ZERO);
        assert_eq!(files.head_file(), FileNumber::FIRST);
        assert!(files.is_initialized());
    }

    #[test]
    fn restart_rebuilds_cache_from_files() {
        let provider = Arc::new(MemoryFileProvider::new());
        {
            let mut files = manager(&provider, DataFileEvaluator::default());
            let mut cache = cache();
            files.initialize_storage(&mut cache).unwrap();
            files
                .store(&mut cache, ts(5), &[(id(1), payload(1, 10)), (id(2), payload(2, 10))])
                .unwrap();
            files.store(&mut cache, ts(9), &[(id(1), payload(7, 4))]).unwrap();
            files.shut_down().unwrap();
        }

        let mut files = manager(&provider, DataFileEvaluator::default());
        let mut cache = cache();
        let inventory = files.initialize_storage(&mut cache).unwrap();
        assert_eq!(inventory.latest_timestamp, ts(9));
        assert_eq!(inventory.record_count, 3);
        assert_eq!(cache.entity_count(), 2);
        assert_eq!(&*files.load(&mut cache, id(1)).unwrap().unwrap(), &payload(7, 4)[..]);
        assert_eq!(&*files.load(&mut cache, id(2)).unwrap().unwrap(), &payload(2, 10)[..]);
    }

    #[test]
    fn torn_tail_is_truncated_on_startup() {
        let provider = Arc::new(MemoryFileProvider::new());
        let intact;
        {
            let mut files = manager(&provider, DataFileEvaluator::default());
            let mut cache = cache();
            files.initialize_storage(&mut cache).unwrap();
            intact = files.store(&mut cache, ts(1), &[(id(1), payload(1, 16))]).unwrap();
            files.shut_down().unwrap();
        }
        let backend = provider.data_file(ChannelIndex::new(0), FileNumber::FIRST).unwrap();
        backend.open().unwrap();
        backend.append(&[b"partial record"]).unwrap();
        backend.close().unwrap();

        let mut files = manager(&provider, DataFileEvaluator::default());
        let mut cache = cache();
        let inventory = files.initialize_storage(&mut cache).unwrap();
        assert_eq!(inventory.truncated_bytes, 14);
        assert_eq!(backend.size().unwrap(), intact);
        assert_eq!(cache.entity_count(), 1);
    }

    // =========================================================================
    // Store / load
    // =========================================================================

    #[test]
    fn superseded_records_become_gaps() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut files = manager(&provider, DataFileEvaluator::default());
        let mut cache = cache();
        files.initialize_storage(&mut cache).unwrap();

        let first = files.store(&mut cache, ts(1), &[(id(1), payload(1, 20))]).unwrap();
        let second = files.store(&mut cache, ts(2), &[(id(1), payload(2, 30))]).unwrap();

        let stats = files.statistics(&cache);
        assert_eq!(stats.total_length(), first + second);
        assert_eq!(stats.data_length(), second);
        assert_eq!(stats.files[0].live_records, 1);
    }

    #[test]
    fn load_of_unknown_entity_is_none() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut files = manager(&provider, DataFileEvaluator::default());
        let mut cache = cache();
        files.initialize_storage(&mut cache).unwrap();
        assert!(files.load(&mut cache, id(42)).unwrap().is_none());
    }

    #[test]
    fn full_head_file_is_retired() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut files = manager(&provider, evaluator(10, 100, 0.5));
        let mut cache = cache();
        files.initialize_storage(&mut cache).unwrap();

        files.store(&mut cache, ts(1), &[(id(1), payload(1, 80))]).unwrap();
        assert_eq!(files.head_file(), FileNumber::new(2));
        files.store(&mut cache, ts(2), &[(id(2), payload(2, 10))]).unwrap();
        assert_eq!(files.file_count(), 2);
        assert_eq!(cache.locate(id(2)).unwrap().file, FileNumber::new(2));
    }

    // =========================================================================
    // Garbage collection and dissolving
    // =========================================================================

    #[test]
    fn swept_entities_stay_dead_after_restart() {
        let provider = Arc::new(MemoryFileProvider::new());
        {
            let mut files = manager(&provider, DataFileEvaluator::default());
            let mut cache = cache();
            files.initialize_storage(&mut cache).unwrap();
            files
                .store(&mut cache, ts(1), &[(id(1), payload(1, 8)), (id(2), payload(2, 8))])
                .unwrap();
            cache.release(id(1));
            let outcome = files.collect_garbage(&mut cache, ts(2), Deadline::unbounded()).unwrap();
            assert!(outcome.completed);
            assert_eq!(outcome.swept, vec![id(1)]);
            files.shut_down().unwrap();
        }

        let mut files = manager(&provider, DataFileEvaluator::default());
        let mut cache = cache();
        files.initialize_storage(&mut cache).unwrap();
        assert!(files.load(&mut cache, id(1)).unwrap().is_none());
        assert!(files.load(&mut cache, id(2)).unwrap().is_some());
    }

    #[test]
    fn sparse_file_is_dissolved_into_head() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut files = manager(&provider, evaluator(10, 200, 0.5));
        let mut cache = cache();
        files.initialize_storage(&mut cache).unwrap();

        // File 1 fills up and is retired with two live records.
        files
            .store(&mut cache, ts(1), &[(id(1), payload(1, 90)), (id(2), payload(2, 90))])
            .unwrap();
        assert_eq!(files.head_file(), FileNumber::new(2));
        // Overwrite entity 1 so file 1 drops below half use.
        files.store(&mut cache, ts(2), &[(id(1), payload(3, 5))]).unwrap();

        assert!(files.check_files(&mut cache, Deadline::unbounded()).unwrap());
        assert_eq!(files.file_count(), 1);
        assert_eq!(cache.locate(id(2)).unwrap().file, FileNumber::new(2));
        assert!(!provider
            .data_file(ChannelIndex::new(0), FileNumber::FIRST)
            .unwrap()
            .exists()
            .unwrap());
        assert_eq!(files.statistics(&cache).data_length(), files.statistics(&cache).total_length());
    }

    #[test]
    fn dissolved_records_survive_restart() {
        let provider = Arc::new(MemoryFileProvider::new());
        {
            let mut files = manager(&provider, evaluator(10, 200, 0.5));
            let mut cache = cache();
            files.initialize_storage(&mut cache).unwrap();
            files
                .store(&mut cache, ts(1), &[(id(1), payload(1, 90)), (id(2), payload(2, 90))])
                .unwrap();
            files.store(&mut cache, ts(2), &[(id(1), payload(3, 5))]).unwrap();
            files.check_files(&mut cache, Deadline::unbounded()).unwrap();
            files.shut_down().unwrap();
        }

        let mut files = manager(&provider, evaluator(10, 200, 0.5));
        let mut cache = cache();
        let inventory = files.initialize_storage(&mut cache).unwrap();
        assert_eq!(inventory.file_count, 1);
        assert_eq!(&*files.load(&mut cache, id(1)).unwrap().unwrap(), &payload(3, 5)[..]);
        assert_eq!(&*files.load(&mut cache, id(2)).unwrap().unwrap(), &payload(2, 90)[..]);
    }

    #[test]
    fn file_in_use_is_deleted_later() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut files = manager(&provider, evaluator(10, 200, 0.5));
        let mut cache = cache();
        files.initialize_storage(&mut cache).unwrap();
        files
            .store(&mut cache, ts(1), &[(id(1), payload(1, 90)), (id(2), payload(2, 90))])
            .unwrap();
        files.store(&mut cache, ts(2), &[(id(1), payload(3, 5))]).unwrap();

        let reader = UserId::fresh();
        let first = Arc::clone(&files.file(FileNumber::FIRST).unwrap().handle);
        first.register_usage(reader);

        files.check_files(&mut cache, Deadline::unbounded()).unwrap();
        assert_eq!(files.statistics(&cache).pending_deletes, 1);
        assert!(first.exists().unwrap());

        first.unregister_usage(reader).unwrap();
        files.check_files(&mut cache, Deadline::unbounded()).unwrap();
        assert_eq!(files.statistics(&cache).pending_deletes, 0);
        assert!(!first.exists().unwrap());
    }

    #[test]
    fn files_in_use_at_shutdown_are_handed_over() {
        let provider = Arc::new(MemoryFileProvider::new());
        let deferred = Arc::new(DeferredDeletions::new());
        let mut files = manager(&provider, evaluator(10, 200, 0.5))
            .with_deferred_deletions(Arc::clone(&deferred));
        let mut cache = cache();
        files.initialize_storage(&mut cache).unwrap();
        files
            .store(&mut cache, ts(1), &[(id(1), payload(1, 90)), (id(2), payload(2, 90))])
            .unwrap();
        files.store(&mut cache, ts(2), &[(id(1), payload(3, 5))]).unwrap();

        let reader = UserId::fresh();
        let first = Arc::clone(&files.file(FileNumber::FIRST).unwrap().handle);
        first.register_usage(reader);
        files.check_files(&mut cache, Deadline::unbounded()).unwrap();
        files.shut_down().unwrap();

        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred.delete_unused().unwrap(), 1);
        assert!(first.exists().unwrap());

        first.unregister_usage(reader).unwrap();
        assert_eq!(deferred.delete_unused().unwrap(), 0);
        assert!(deferred.is_empty());
        assert!(!first.exists().unwrap());
    }

    #[test]
    fn expired_deadline_checks_nothing() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut files = manager(&provider, evaluator(10, 200, 0.5));
        let mut cache = cache();
        files.initialize_storage(&mut cache).unwrap();
        files
            .store(&mut cache, ts(1), &[(id(1), payload(1, 90)), (id(2), payload(2, 90))])
            .unwrap();
        files.store(&mut cache, ts(2), &[(id(1), payload(3, 5))]).unwrap();

        let deadline = Deadline::after(std::time::Duration::ZERO);
        assert!(!files.check_files(&mut cache, deadline).unwrap());
        assert_eq!(files.file_count(), 2);
    }

    // =========================================================================
    // Export
    // =========================================================================

    #[test]
    fn export_copies_every_file() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut files = manager(&provider, DataFileEvaluator::default());
        let mut cache = cache();
        files.initialize_storage(&mut cache).unwrap();
        let written = files.store(&mut cache, ts(1), &[(id(1), payload(1, 12))]).unwrap();

        let target = tempfile::tempdir().unwrap();
        let exported = files.export(target.path()).unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].length, written);

        let copy = std::fs::read(target.path().join("channel_0").join(&exported[0].name)).unwrap();
        assert_eq!(copy.len() as u64, written);
        // The export released its usage again.
        assert_eq!(files.file(FileNumber::FIRST).unwrap().handle.user_count(), 1);
    }
}
