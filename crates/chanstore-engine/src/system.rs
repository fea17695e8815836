use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use chanstore_backup::{BackupHandler, BackupItemQueue, FileBackupHandler};
use chanstore_file::{DataFileEvaluator, FileProvider, LocalFileProvider, MemoryFileProvider};
use chanstore_types::{ChannelCount, ChannelIndex, EntityId};

use crate::backup_worker::BackupWorker;
use crate::broker::TaskBroker;
use crate::cache::{EntityCache, InMemoryEntityCache};
use crate::channel::{Channel, ChannelWorker};
use crate::config::StorageConfig;
use crate::controller::{LivenessSignal, OperationController};
use crate::error::{Disruption, EngineError, EngineResult};
use crate::files::{ChannelFileManager, ChannelStatistics, DeferredDeletions, ExportedFile};
use crate::hasher::{ChannelHasher, ModuloHasher};
use crate::task::work::{
    BarrierWork, CacheCheckWork, ExportWork, FileCheckWork, GarbageCollectionResult,
    GarbageCollectionWork, InitializeWork, LoadWork, ShutdownWork, StatisticsWork, StoreReceipt,
    StoreSlice, StoreWork,
};

/// Builds the entity cache of one channel.
pub type CacheFactory = Arc<dyn Fn(ChannelIndex) -> Box<dyn EntityCache> + Send + Sync>;

/// Pluggable parts of a [`StorageSystem`].
pub struct StorageComponents {
    pub file_provider: Arc<dyn FileProvider>,
    pub cache_factory: CacheFactory,
    pub hasher: Arc<dyn ChannelHasher>,
    /// Replaces the [`FileBackupHandler`] built from the backup config.
    pub backup_handler: Option<Box<dyn BackupHandler + Send>>,
}

impl StorageComponents {
    /// Data files under the configured storage directory.
    pub fn local(config: &StorageConfig) -> Self {
        Self::with_provider(config, Arc::new(LocalFileProvider::new(&config.storage_directory)))
    }

    /// Data files in memory; useful for tests and throwaway stores.
    pub fn in_memory(config: &StorageConfig) -> Self {
        Self::with_provider(config, Arc::new(MemoryFileProvider::new()))
    }

    pub fn with_provider(config: &StorageConfig, file_provider: Arc<dyn FileProvider>) -> Self {
        let byte_limit = config.cache.byte_limit;
        Self {
            file_provider,
            cache_factory: Arc::new(move |_: ChannelIndex| -> Box<dyn EntityCache> {
                Box::new(InMemoryEntityCache::new(byte_limit))
            }),
            hasher: Arc::new(ModuloHasher),
            backup_handler: None,
        }
    }
}

impl fmt::Debug for StorageComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageComponents")
            .field("file_provider", &self.file_provider)
            .field("hasher", &self.hasher)
            .field("backup_handler", &self.backup_handler.is_some())
            .finish_non_exhaustive()
    }
}

/// Per-channel statistics of a running system.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StorageStatistics {
    pub channels: Vec<ChannelStatistics>,
}

impl StorageStatistics {
    pub fn entity_count(&self) -> usize {
        self.channels.iter().map(|c| c.entity_count).sum()
    }

    pub fn file_count(&self) -> usize {
        self.channels.iter().map(|c| c.files.len()).sum()
    }

    pub fn total_length(&self) -> u64 {
        self.channels.iter().map(ChannelStatistics::total_length).sum()
    }

    pub fn data_length(&self) -> u64 {
        self.channels.iter().map(ChannelStatistics::data_length).sum()
    }
}

/// A running set of channels plus the optional backup thread.
///
/// Every operation is one task dispatched to all channels; the call returns
/// once every channel reported, with the combined result or the aggregated
/// failure.
pub struct StorageSystem {
    config: StorageConfig,
    channel_count: ChannelCount,
    controller: Arc<OperationController>,
    liveness: LivenessSignal,
    broker: TaskBroker,
    hasher: Arc<dyn ChannelHasher>,
    workers: Vec<ChannelWorker>,
    backup: Option<BackupWorker>,
    deferred: Arc<DeferredDeletions>,
    running: bool,
}

impl StorageSystem {
    /// Start a system over the configured storage directory.
    pub fn start(config: StorageConfig) -> EngineResult<Self> {
        let components = StorageComponents::local(&config);
        Self::start_with(config, components)
    }

    /// Start channels, initialize their storage and start the backup thread.
    pub fn start_with(config: StorageConfig, components: StorageComponents) -> EngineResult<Self> {
        config.validate()?;
        let channel_count = config.channel_count()?;
        let evaluator = DataFileEvaluator::new(config.data_files.clone())?;
        let liveness = LivenessSignal::new();
        let controller = Arc::new(OperationController::new(liveness.clone()));
        let backup_queue = config.backup.as_ref().map(|_| Arc::new(BackupItemQueue::new()));
        let deferred = Arc::new(DeferredDeletions::new());

        let mut workers = Vec::with_capacity(channel_count.as_usize());
        for index in channel_count.indices() {
            let files = ChannelFileManager::new(
                index,
                Arc::clone(&components.file_provider),
                evaluator.clone(),
                backup_queue.clone(),
            )
            .with_deferred_deletions(Arc::clone(&deferred));
            let channel = Channel::new(
                index,
                Arc::clone(&controller),
                (components.cache_factory)(index),
                files,
                config.housekeeping.clone(),
            );
            match ChannelWorker::spawn(channel) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    join_all(workers);
                    return Err(e);
                }
            }
        }

        let mailboxes = workers.iter().map(|w| Arc::clone(w.mailbox())).collect();
        let broker = TaskBroker::new(channel_count, Arc::clone(&controller), mailboxes)?;

        let init = broker.issue_initialization(InitializeWork);
        let inventories = match init.wait_for_results() {
            Ok(inventories) => inventories,
            Err(e) => {
                controller.deactivate();
                broker.close_mailboxes();
                join_all(workers);
                return Err(e.into());
            }
        };
        if let Some(latest) = inventories.iter().map(|i| i.latest_timestamp).max() {
            broker.advance_clock_past(latest);
        }

        let mut system = Self {
            channel_count,
            controller,
            liveness,
            broker,
            hasher: components.hasher,
            workers,
            backup: None,
            deferred,
            running: true,
            config,
        };

        if let (Some(queue), Some(backup_config)) = (backup_queue, system.config.backup.clone()) {
            let handler: Box<dyn BackupHandler + Send> = match components.backup_handler {
                Some(handler) => handler,
                None => Box::new(FileBackupHandler::new(backup_config.clone())),
            };
            let poll_timeout = Duration::from_millis(backup_config.poll_timeout_ms);
            match BackupWorker::spawn(
                queue,
                handler,
                Arc::clone(&system.controller),
                poll_timeout,
            ) {
                Ok(worker) => system.backup = Some(worker),
                Err(e) => {
                    if let Err(shutdown) = system.shutdown() {
                        warn!(error = %shutdown, "shutdown after failed start failed");
                    }
                    return Err(e);
                }
            }
        }

        info!(
            channels = channel_count.get(),
            files = inventories.iter().map(|i| i.file_count).sum::<usize>(),
            records = inventories.iter().map(|i| i.record_count).sum::<usize>(),
            backup = system.backup.is_some(),
            "storage system started"
        );
        Ok(system)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn channel_count(&self) -> ChannelCount {
        self.channel_count
    }

    pub fn channel_of(&self, entity: EntityId) -> ChannelIndex {
        self.hasher.channel_of(entity, self.channel_count)
    }

    /// Whether the system was started and neither shut down nor disrupted.
    pub fn is_running(&self) -> bool {
        self.running && self.controller.is_active() && !self.controller.has_disruptions()
    }

    pub fn is_accepting_tasks(&self) -> bool {
        self.running && self.broker.is_accepting_tasks()
    }

    pub fn disruptions(&self) -> Vec<Disruption> {
        self.controller.disruptions()
    }

    fn ensure_slice_count(&self, actual: usize) -> EngineResult<()> {
        let expected = self.channel_count.as_usize();
        if actual != expected {
            return Err(EngineError::ChannelCountMismatch { expected, actual });
        }
        Ok(())
    }

    fn empty_slices<T: Default>(&self) -> Vec<T> {
        (0..self.channel_count.as_usize()).map(|_| T::default()).collect()
    }

    // -- store / load --------------------------------------------------------

    /// Persist entities, routing each to its channel.
    pub fn store(&self, entities: Vec<(EntityId, Vec<u8>)>) -> EngineResult<StoreReceipt> {
        let mut slices: Vec<StoreSlice> = self.empty_slices();
        for (entity, payload) in entities {
            slices[self.channel_of(entity).as_usize()]
                .entities
                .push((entity, payload));
        }
        self.store_slices(slices)
    }

    /// Mark entities as garbage. They disappear with the next garbage collection.
    ///
    /// Returns how many of them were live.
    pub fn release(&self, entities: &[EntityId]) -> EngineResult<usize> {
        let mut slices: Vec<StoreSlice> = self.empty_slices();
        for entity in entities {
            slices[self.channel_of(*entity).as_usize()].releases.push(*entity);
        }
        Ok(self.store_slices(slices)?.released)
    }

    /// Store pre-split requests, one slice per channel.
    pub fn store_slices(&self, slices: Vec<StoreSlice>) -> EngineResult<StoreReceipt> {
        self.ensure_slice_count(slices.len())?;
        let task = self.broker.issue(StoreWork::new(slices))?;
        let receipts = task.wait_for_results()?;
        Ok(receipts.iter().fold(StoreReceipt::default(), |sum, r| StoreReceipt {
            entities: sum.entities + r.entities,
            released: sum.released + r.released,
            bytes: sum.bytes + r.bytes,
        }))
    }

    /// Load payloads, in the order of `entities`. Unknown or released entities
    /// load as `None`.
    pub fn load(&self, entities: &[EntityId]) -> EngineResult<Vec<Option<Arc<[u8]>>>> {
        let mut requests: Vec<Vec<EntityId>> = self.empty_slices();
        let mut positions: Vec<Vec<usize>> = self.empty_slices();
        for (position, entity) in entities.iter().enumerate() {
            let channel = self.channel_of(*entity).as_usize();
            requests[channel].push(*entity);
            positions[channel].push(position);
        }

        let mut loaded = vec![None; entities.len()];
        for (results, positions) in self.load_slices(requests)?.into_iter().zip(positions) {
            for ((_, data), position) in results.into_iter().zip(positions) {
                loaded[position] = data;
            }
        }
        Ok(loaded)
    }

    /// Load pre-split requests, one id list per channel.
    pub fn load_slices(
        &self,
        requests: Vec<Vec<EntityId>>,
    ) -> EngineResult<Vec<Vec<(EntityId, Option<Arc<[u8]>>)>>> {
        self.ensure_slice_count(requests.len())?;
        let task = self.broker.issue(LoadWork::new(requests))?;
        Ok(task.wait_for_results()?)
    }

    // -- maintenance ---------------------------------------------------------

    /// Sweep released entities. `None` runs a full collection.
    pub fn collect_garbage(
        &self,
        budget: Option<Duration>,
    ) -> EngineResult<GarbageCollectionResult> {
        let task = self.broker.issue(GarbageCollectionWork { budget })?;
        Ok(combine_gc(&task.wait_for_results()?))
    }

    /// Dissolve sparse data files. Returns whether every channel checked all files.
    pub fn check_files(&self, budget: Option<Duration>) -> EngineResult<bool> {
        let task = self.broker.issue(FileCheckWork { budget })?;
        Ok(task.wait_for_results()?.into_iter().all(|done| done))
    }

    /// Evict cached payloads. Returns whether every cache is within budget.
    pub fn check_cache(&self, budget: Option<Duration>) -> EngineResult<bool> {
        let task = self.broker.issue(CacheCheckWork { budget })?;
        Ok(task.wait_for_results()?.into_iter().all(|done| done))
    }

    /// Copy every channel's data files into `target`, optionally after a full
    /// garbage collection that no other task can interleave with.
    pub fn export_channels(
        &self,
        target: &Path,
        collect_garbage_first: bool,
    ) -> EngineResult<Vec<ExportedFile>> {
        let export = ExportWork {
            target: target.to_path_buf(),
        };
        let task = if collect_garbage_first {
            let (gc, export) =
                self.broker.issue_pair(GarbageCollectionWork { budget: None }, export)?;
            gc.wait_on_completion()?;
            export
        } else {
            self.broker.issue(export)?
        };
        let exported: Vec<ExportedFile> = task.wait_for_results()?.into_iter().flatten().collect();
        info!(directory = %target.display(), files = exported.len(), "channels exported");
        Ok(exported)
    }

    pub fn statistics(&self) -> EngineResult<StorageStatistics> {
        let task = self.broker.issue(StatisticsWork)?;
        Ok(StorageStatistics {
            channels: task.wait_for_results()?,
        })
    }

    /// Wait until every channel processed every earlier task.
    pub fn barrier(&self) -> EngineResult<()> {
        self.broker.issue(BarrierWork)?.wait_on_completion()?;
        Ok(())
    }

    // -- shutdown ------------------------------------------------------------

    /// Stop the system: shut down the channels, drain the backup queue, then
    /// disable processing.
    ///
    /// Every step runs even if an earlier one failed; the first error is returned.
    pub fn shutdown(&mut self) -> EngineResult<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        let mut first_error = None;

        if self.broker.is_accepting_tasks() {
            let outcome = self
                .broker
                .issue(ShutdownWork)
                .and_then(|task| Ok(task.wait_on_completion()?));
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        self.broker.close_mailboxes();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.join() {
                first_error.get_or_insert(e);
            }
        }
        if let Some(backup) = self.backup.take() {
            if let Err(e) = backup.stop() {
                first_error.get_or_insert(e);
            }
        }

        // With the backup drained, files dissolved during the run are unused.
        match self.deferred.delete_unused() {
            Ok(0) => {}
            Ok(remaining) => warn!(files = remaining, "dissolved files still in use; not deleted"),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        self.controller.deactivate();
        self.liveness.raise();
        info!(disruptions = self.controller.disruptions().len(), "storage system stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for StorageSystem {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "shutdown on drop failed");
        }
    }
}

impl fmt::Debug for StorageSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSystem")
            .field("channel_count", &self.channel_count)
            .field("running", &self.running)
            .field("backup", &self.backup.is_some())
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

fn join_all(workers: Vec<ChannelWorker>) {
    for worker in workers {
        if let Err(e) = worker.join() {
            warn!(error = %e, "channel thread failed");
        }
    }
}

fn combine_gc(results: &[GarbageCollectionResult]) -> GarbageCollectionResult {
    GarbageCollectionResult {
        completed: results.iter().all(|r| r.completed),
        swept: results.iter().map(|r| r.swept).sum(),
    }
}
