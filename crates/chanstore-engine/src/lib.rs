//! Channel engine for chanstore.
//!
//! The engine shards the stored entities over a fixed, power-of-two number of
//! channels. Each channel is one thread owning its entity cache and its data
//! files exclusively. Work reaches channels only as tasks: the
//! [`TaskBroker`] hands the same [`Task`] to every channel, each channel
//! processes its slice, and the caller waits until all of them reported.
//!
//! # Components
//!
//! - [`OperationController`] -- process-wide gate; flipped off by the first
//!   disruption
//! - [`Task`] / [`TaskProgress`] -- fan-out of one piece of work, fan-in of
//!   per-channel results and problems
//! - [`TaskBroker`] -- orders and dispatches tasks
//! - [`Channel`] / [`ChannelWorker`] -- per-channel state and thread
//! - [`ChannelFileManager`] -- head file, retirement, dissolving, export
//! - [`EntityCache`] -- per-channel entity index, with [`InMemoryEntityCache`]
//! - [`BackupWorker`] -- applies queued backup items on its own thread
//! - [`StorageSystem`] -- starts, drives and stops all of the above
//!
//! # Design Rules
//!
//! 1. Every channel reports exactly once per task, success or failure; a
//!    failing channel never blocks the others.
//! 2. A dispatcher is released once all channels reported (full barrier), or
//!    early with the aggregated failure as soon as a problem is registered.
//! 3. Tasks run strictly sequentially on each channel and in the same order
//!    on all channels.
//! 4. The first disruption disables processing for good; new tasks are rejected.
//! 5. Every byte appended, truncated or deleted in a data file is mirrored to
//!    the backup queue when backup is enabled.

pub mod backup_worker;
pub mod broker;
pub mod cache;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod files;
pub mod hasher;
pub mod record;
pub mod system;
pub mod task;

// Re-export primary types at crate root for ergonomic imports.
pub use backup_worker::BackupWorker;
pub use broker::TaskBroker;
pub use cache::{EntityCache, EntityLocation, GcOutcome, InMemoryEntityCache, LiveRecord};
pub use channel::{Channel, ChannelWorker, Mailbox};
pub use config::{EntityCacheConfig, HousekeepingConfig, StorageConfig};
pub use controller::{LivenessSignal, OperationController};
pub use error::{
    AggregateProblems, ChannelProblem, Disruption, DisruptionReport, EngineError, EngineResult,
    Problem, TaskError,
};
pub use files::{
    ChannelFileManager, ChannelStatistics, ExportedFile, FileStatistics, StorageInventory,
};
pub use hasher::{ChannelHasher, ModuloHasher};
pub use record::{RecordKind, MAX_PAYLOAD_LENGTH, RECORD_HEADER_SIZE};
pub use system::{CacheFactory, StorageComponents, StorageStatistics, StorageSystem};
pub use task::work::{GarbageCollectionResult, StoreReceipt, StoreSlice};
pub use task::{ChannelTask, Task, TaskKind, TaskProgress, TaskScope, TaskWork};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use chanstore_backup::{BackupConfig, BackupError, BackupHandler, BackupResult};
    use chanstore_file::{
        DataFileEvaluatorConfig, FileBackend, FileError, FileHandle, FileProvider, FileResult,
        MemoryFileProvider,
    };
    use chanstore_types::{ChannelIndex, EntityId, FileNumber};

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn config(channels: u32) -> StorageConfig {
        StorageConfig {
            channel_count: channels,
            // Keep idle housekeeping out of the way of the assertions.
            housekeeping: HousekeepingConfig {
                interval_ms: 60_000,
                ..HousekeepingConfig::default()
            },
            ..StorageConfig::default()
        }
    }

    fn start_in_memory(config: StorageConfig, provider: &Arc<MemoryFileProvider>) -> StorageSystem {
        let provider: Arc<dyn FileProvider> = provider.clone();
        let components = StorageComponents::with_provider(&config, provider);
        StorageSystem::start_with(config, components).unwrap()
    }

    fn entities(range: std::ops::Range<u64>) -> Vec<(EntityId, Vec<u8>)> {
        range
            .map(|n| (EntityId::new(n), format!("entity-{n}").into_bytes()))
            .collect()
    }

    fn ids(range: std::ops::Range<u64>) -> Vec<EntityId> {
        range.map(EntityId::new).collect()
    }

    /// Provider whose listing fails for one channel.
    #[derive(Debug)]
    struct FailingProvider {
        inner: MemoryFileProvider,
        failing: ChannelIndex,
    }

    impl FileProvider for FailingProvider {
        fn data_file(
            &self,
            channel: ChannelIndex,
            number: FileNumber,
        ) -> FileResult<Arc<dyn FileBackend>> {
            self.inner.data_file(channel, number)
        }

        fn existing_data_files(
            &self,
            channel: ChannelIndex,
        ) -> FileResult<Vec<(FileNumber, Arc<dyn FileBackend>)>> {
            if channel == self.failing {
                return Err(FileError::NotFound(format!("{channel} directory")));
            }
            self.inner.existing_data_files(channel)
        }
    }

    /// Rejects every non-empty copy.
    struct RejectingBackup;

    impl BackupHandler for RejectingBackup {
        fn copy_file_part(
            &mut self,
            file: &FileHandle,
            _position: u64,
            length: u64,
        ) -> BackupResult<()> {
            if length == 0 {
                return Ok(());
            }
            Err(BackupError::LengthMismatch {
                file: file.identifier().to_string(),
                expected: length,
                actual: 0,
            })
        }

        fn truncate_file(&mut self, _file: &FileHandle, _new_length: u64) -> BackupResult<()> {
            Ok(())
        }

        fn delete_file(&mut self, _file: &FileHandle) -> BackupResult<()> {
            Ok(())
        }
    }

    /// Holds every copy until the gate opens.
    struct GatedBackup {
        open: Arc<AtomicBool>,
    }

    impl BackupHandler for GatedBackup {
        fn copy_file_part(
            &mut self,
            _file: &FileHandle,
            _position: u64,
            _length: u64,
        ) -> BackupResult<()> {
            while !self.open.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }

        fn truncate_file(&mut self, _file: &FileHandle, _new_length: u64) -> BackupResult<()> {
            Ok(())
        }

        fn delete_file(&mut self, _file: &FileHandle) -> BackupResult<()> {
            Ok(())
        }
    }

    // =========================================================================
    // Store / load / release
    // =========================================================================

    #[test]
    fn stored_entities_load_in_request_order() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut system = start_in_memory(config(4), &provider);
        assert!(system.is_running());
        assert!(system.is_accepting_tasks());

        let receipt = system.store(entities(0..40)).unwrap();
        assert_eq!(receipt.entities, 40);

        let requested =
            vec![EntityId::new(17), EntityId::new(999), EntityId::new(2), EntityId::new(35)];
        let loaded = system.load(&requested).unwrap();
        assert_eq!(loaded[0].as_deref(), Some(&b"entity-17"[..]));
        assert!(loaded[1].is_none());
        assert_eq!(loaded[2].as_deref(), Some(&b"entity-2"[..]));
        assert_eq!(loaded[3].as_deref(), Some(&b"entity-35"[..]));

        let stats = system.statistics().unwrap();
        assert_eq!(stats.channels.len(), 4);
        assert_eq!(stats.entity_count(), 40);
        assert!(stats.channels.iter().all(|c| c.entity_count == 10));

        system.shutdown().unwrap();
        assert!(!system.is_running());
        assert!(matches!(system.store(entities(0..1)), Err(EngineError::NotAccepting)));
    }

    #[test]
    fn released_entities_vanish_after_collection() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut system = start_in_memory(config(2), &provider);
        system.store(entities(0..10)).unwrap();

        assert_eq!(system.release(&ids(0..4)).unwrap(), 4);
        assert!(system.load(&ids(0..1)).unwrap()[0].is_none());

        let gc = system.collect_garbage(None).unwrap();
        assert!(gc.completed);
        assert_eq!(gc.swept, 4);
        assert_eq!(system.statistics().unwrap().entity_count(), 6);
        system.shutdown().unwrap();

        // Tombstones keep them dead across a restart.
        let mut restarted = start_in_memory(config(2), &provider);
        let loaded = restarted.load(&ids(0..10)).unwrap();
        assert_eq!(loaded.iter().filter(|l| l.is_some()).count(), 6);
        restarted.shutdown().unwrap();
    }

    #[test]
    fn restart_recovers_latest_versions() {
        let provider = Arc::new(MemoryFileProvider::new());
        {
            let mut system = start_in_memory(config(2), &provider);
            system.store(entities(0..6)).unwrap();
            system
                .store(vec![(EntityId::new(3), b"updated".to_vec())])
                .unwrap();
            system.shutdown().unwrap();
        }

        let mut system = start_in_memory(config(2), &provider);
        let loaded = system.load(&ids(0..6)).unwrap();
        assert_eq!(loaded[3].as_deref(), Some(&b"updated"[..]));
        assert_eq!(loaded[5].as_deref(), Some(&b"entity-5"[..]));
        system.shutdown().unwrap();
    }

    #[test]
    fn slice_count_must_match_channel_count() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut system = start_in_memory(config(2), &provider);
        assert!(matches!(
            system.store_slices(vec![StoreSlice::default()]),
            Err(EngineError::ChannelCountMismatch { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            system.load_slices(vec![Vec::new(); 3]),
            Err(EngineError::ChannelCountMismatch { expected: 2, actual: 3 })
        ));
        system.shutdown().unwrap();
    }

    #[test]
    fn concurrent_callers_share_the_system() {
        let provider = Arc::new(MemoryFileProvider::new());
        let system = Arc::new(start_in_memory(config(4), &provider));

        let callers: Vec<_> = (0..4u64)
            .map(|t| {
                let system = Arc::clone(&system);
                thread::spawn(move || {
                    for batch in 0..10 {
                        let start = t * 1000 + batch * 10;
                        system.store(entities(start..start + 10)).unwrap();
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }
        assert_eq!(system.statistics().unwrap().entity_count(), 400);
    }

    // =========================================================================
    // Failure handling
    // =========================================================================

    #[test]
    fn failing_channel_fails_start_with_its_problem_only() {
        let config = config(4);
        let provider = Arc::new(FailingProvider {
            inner: MemoryFileProvider::new(),
            failing: ChannelIndex::new(2),
        });
        let components = StorageComponents::with_provider(&config, provider);

        match StorageSystem::start_with(config, components) {
            Err(EngineError::Task(TaskError::Failed(aggregate))) => {
                assert_eq!(aggregate.kind, TaskKind::Initialize);
                assert_eq!(aggregate.channels().collect::<Vec<_>>(), vec![ChannelIndex::new(2)]);
                assert!(aggregate.to_string().contains("does not exist"));
            }
            other => panic!("expected aggregated failure, got {other:?}"),
        }
    }

    #[test]
    fn backup_failure_disrupts_the_system() {
        let backup_dir = tempfile::tempdir().unwrap();
        let mut config = config(2);
        config.backup = Some(BackupConfig {
            directory: backup_dir.path().to_path_buf(),
            poll_timeout_ms: 10,
            ..BackupConfig::default()
        });
        let provider: Arc<dyn FileProvider> = Arc::new(MemoryFileProvider::new());
        let mut components = StorageComponents::with_provider(&config, provider);
        components.backup_handler = Some(Box::new(RejectingBackup));
        let mut system = StorageSystem::start_with(config, components).unwrap();

        system.store(entities(0..4)).unwrap();
        for _ in 0..400 {
            if !system.disruptions().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let disruptions = system.disruptions();
        assert_eq!(disruptions.len(), 1);
        assert_eq!(disruptions[0].channel, None);
        assert!(!system.is_running());
        assert!(!system.is_accepting_tasks());
        assert!(matches!(system.store(entities(4..5)), Err(EngineError::Disrupted(_))));
        system.shutdown().unwrap();
    }

    // =========================================================================
    // Files, backup and export on disk
    // =========================================================================

    #[test]
    fn backup_mirrors_live_files() {
        let storage = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            storage_directory: storage.path().to_path_buf(),
            channel_count: 2,
            backup: Some(BackupConfig {
                directory: backup.path().to_path_buf(),
                poll_timeout_ms: 10,
                ..BackupConfig::default()
            }),
            ..StorageConfig::default()
        };

        let mut system = StorageSystem::start(config).unwrap();
        system.store(entities(0..20)).unwrap();
        system.store(entities(5..10)).unwrap();
        system.shutdown().unwrap();

        for channel in ["channel_0", "channel_1"] {
            let name = format!("{channel}_1.dat");
            let live = std::fs::read(storage.path().join(channel).join(&name)).unwrap();
            let mirrored = std::fs::read(backup.path().join(channel).join(&name)).unwrap();
            assert!(!live.is_empty());
            assert_eq!(live, mirrored);
        }
    }

    #[test]
    fn leftover_backup_over_empty_storage_disrupts() {
        let storage = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let stale = backup.path().join("channel_0").join("channel_0_1.dat");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"STALE-OLD!").unwrap();

        let config = StorageConfig {
            storage_directory: storage.path().to_path_buf(),
            backup: Some(BackupConfig {
                directory: backup.path().to_path_buf(),
                poll_timeout_ms: 10,
                ..BackupConfig::default()
            }),
            ..config(1)
        };
        // The storage is empty; only its new first file meets the leftover backup.
        let mut system = StorageSystem::start(config).unwrap();
        for _ in 0..400 {
            if !system.disruptions().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let disruptions = system.disruptions();
        assert_eq!(disruptions.len(), 1);
        assert!(disruptions[0].to_string().contains("backup of"));
        assert!(!system.is_accepting_tasks());
        system.shutdown().unwrap();
        assert_eq!(std::fs::read(&stale).unwrap(), b"STALE-OLD!");
    }

    #[test]
    fn local_storage_survives_restart() {
        let storage = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            storage_directory: storage.path().to_path_buf(),
            channel_count: 2,
            ..StorageConfig::default()
        };

        let mut system = StorageSystem::start(config.clone()).unwrap();
        system.store(entities(0..8)).unwrap();
        system.shutdown().unwrap();
        drop(system);

        let mut system = StorageSystem::start(config).unwrap();
        assert_eq!(system.load(&ids(7..8)).unwrap()[0].as_deref(), Some(&b"entity-7"[..]));
        system.shutdown().unwrap();
    }

    #[test]
    fn export_after_collection_copies_all_channels() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut system = start_in_memory(config(2), &provider);
        system.store(entities(0..10)).unwrap();
        system.release(&ids(0..2)).unwrap();

        let target = tempfile::tempdir().unwrap();
        let exported = system.export_channels(target.path(), true).unwrap();
        assert_eq!(exported.len(), 2);
        for file in &exported {
            let path = target
                .path()
                .join(format!("channel_{}", file.channel.get()))
                .join(&file.name);
            assert_eq!(std::fs::metadata(path).unwrap().len(), file.length);
        }
        // The prepended collection already swept the released entities.
        assert_eq!(system.collect_garbage(None).unwrap().swept, 0);
        system.shutdown().unwrap();
    }

    #[test]
    fn file_check_dissolves_sparse_files() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut config = config(1);
        config.data_files = DataFileEvaluatorConfig {
            minimum_file_size: 64,
            maximum_file_size: 256,
            minimum_use_ratio: 0.5,
            clean_up_head_file: true,
        };
        let mut system = start_in_memory(config, &provider);

        let big = |n: u64| (EntityId::new(n), vec![n as u8; 100]);
        system.store(vec![big(1), big(2), big(3)]).unwrap();
        system.store(vec![big(1), big(2)]).unwrap();
        assert!(system.statistics().unwrap().file_count() >= 2);

        assert!(system.check_files(None).unwrap());
        let stats = system.statistics().unwrap();
        assert_eq!(stats.entity_count(), 3);
        assert!(stats.channels[0]
            .files
            .iter()
            .all(|f| f.fill_ratio >= 0.5 || f.number == stats.channels[0].head_file));

        let loaded = system.load(&ids(1..4)).unwrap();
        assert!(loaded.iter().all(Option::is_some));
        system.shutdown().unwrap();
    }

    #[test]
    fn dissolved_file_held_by_backup_is_deleted_at_shutdown() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut config = config(1);
        config.data_files = DataFileEvaluatorConfig {
            minimum_file_size: 64,
            maximum_file_size: 256,
            minimum_use_ratio: 0.5,
            clean_up_head_file: true,
        };
        config.backup = Some(BackupConfig {
            poll_timeout_ms: 10,
            ..BackupConfig::default()
        });
        let open = Arc::new(AtomicBool::new(false));
        let file_provider: Arc<dyn FileProvider> = provider.clone();
        let mut components = StorageComponents::with_provider(&config, file_provider);
        components.backup_handler = Some(Box::new(GatedBackup {
            open: Arc::clone(&open),
        }));
        let mut system = StorageSystem::start_with(config, components).unwrap();

        let big = |n: u64| (EntityId::new(n), vec![n as u8; 100]);
        system.store(vec![big(1), big(2), big(3)]).unwrap();
        system.store(vec![big(1), big(2)]).unwrap();
        system.check_files(None).unwrap();
        // The pending backup copy still uses the first file.
        assert_eq!(system.statistics().unwrap().channels[0].pending_deletes, 1);

        open.store(true, Ordering::Release);
        system.shutdown().unwrap();

        let remaining: Vec<FileNumber> = provider
            .existing_data_files(ChannelIndex::new(0))
            .unwrap()
            .into_iter()
            .map(|(number, _)| number)
            .collect();
        assert!(!remaining.contains(&FileNumber::FIRST));
        assert!(!remaining.is_empty());
    }

    #[test]
    fn dropping_a_running_system_shuts_it_down() {
        let provider = Arc::new(MemoryFileProvider::new());
        let system = start_in_memory(config(2), &provider);
        system.store(entities(0..4)).unwrap();
        drop(system);

        let mut restarted = start_in_memory(config(2), &provider);
        assert_eq!(restarted.statistics().unwrap().entity_count(), 4);
        restarted.shutdown().unwrap();
    }
}
