//! The concrete work of every task kind.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use chanstore_types::{Deadline, EntityId};

use crate::channel::Channel;
use crate::error::EngineResult;
use crate::files::{ChannelStatistics, ExportedFile, StorageInventory};
use crate::task::{TaskKind, TaskScope, TaskWork};

fn deadline(budget: Option<Duration>) -> Deadline {
    budget.map_or(Deadline::unbounded(), Deadline::after)
}

/// Open the channel's files, rebuild its cache and, once every channel got
/// that far, enable channel processing.
#[derive(Debug)]
pub struct InitializeWork;

impl TaskWork for InitializeWork {
    type Output = StorageInventory;

    fn kind(&self) -> TaskKind {
        TaskKind::Initialize
    }

    fn process(
        &self,
        _scope: &TaskScope<'_>,
        channel: &mut Channel,
    ) -> EngineResult<StorageInventory> {
        channel.initialize_storage()
    }

    fn complete(
        &self,
        scope: &TaskScope<'_>,
        channel: &mut Channel,
        inventory: StorageInventory,
    ) -> EngineResult<StorageInventory> {
        // If another channel failed, processing stays disabled and every
        // channel stops on its own once this task is done.
        if scope.progress.wait_for_processing().is_ok() {
            channel.controller().activate()?;
        }
        Ok(inventory)
    }
}

/// Release every file of the channel. The channel stops afterwards.
#[derive(Debug)]
pub struct ShutdownWork;

impl TaskWork for ShutdownWork {
    type Output = ();

    fn kind(&self) -> TaskKind {
        TaskKind::Shutdown
    }

    fn process(&self, _scope: &TaskScope<'_>, channel: &mut Channel) -> EngineResult<()> {
        channel.shut_down()
    }
}

/// One channel's share of a store request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreSlice {
    pub entities: Vec<(EntityId, Vec<u8>)>,
    /// Entities that became garbage.
    pub releases: Vec<EntityId>,
}

impl StoreSlice {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.releases.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreReceipt {
    pub entities: usize,
    pub released: usize,
    pub bytes: u64,
}

/// Append entity records and apply releases, one slice per channel.
#[derive(Debug)]
pub struct StoreWork {
    slices: Vec<Mutex<Option<StoreSlice>>>,
}

impl StoreWork {
    /// `slices[i]` is handled by channel `i`.
    pub fn new(slices: Vec<StoreSlice>) -> Self {
        Self {
            slices: slices.into_iter().map(|s| Mutex::new(Some(s))).collect(),
        }
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }
}

impl TaskWork for StoreWork {
    type Output = StoreReceipt;

    fn kind(&self) -> TaskKind {
        TaskKind::Store
    }

    fn process(&self, scope: &TaskScope<'_>, channel: &mut Channel) -> EngineResult<StoreReceipt> {
        let slice = self
            .slices
            .get(channel.index().as_usize())
            .and_then(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).take())
            .unwrap_or_default();

        let bytes = channel.store(scope.timestamp, &slice.entities)?;
        let released = channel.release(&slice.releases);
        Ok(StoreReceipt {
            entities: slice.entities.len(),
            released,
            bytes,
        })
    }
}

/// Load entity payloads, one id list per channel.
#[derive(Debug)]
pub struct LoadWork {
    requests: Vec<Vec<EntityId>>,
}

impl LoadWork {
    pub fn new(requests: Vec<Vec<EntityId>>) -> Self {
        Self { requests }
    }
}

impl TaskWork for LoadWork {
    type Output = Vec<(EntityId, Option<Arc<[u8]>>)>;

    fn kind(&self) -> TaskKind {
        TaskKind::Load
    }

    fn process(&self, _scope: &TaskScope<'_>, channel: &mut Channel) -> EngineResult<Self::Output> {
        match self.requests.get(channel.index().as_usize()) {
            Some(ids) => channel.load(ids),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GarbageCollectionResult {
    /// Whether all pending garbage was swept within the budget.
    pub completed: bool,
    pub swept: usize,
}

/// Sweep released entities; `None` budget means a full collection.
#[derive(Debug)]
pub struct GarbageCollectionWork {
    pub budget: Option<Duration>,
}

impl TaskWork for GarbageCollectionWork {
    type Output = GarbageCollectionResult;

    fn kind(&self) -> TaskKind {
        TaskKind::GarbageCollection
    }

    fn process(
        &self,
        scope: &TaskScope<'_>,
        channel: &mut Channel,
    ) -> EngineResult<GarbageCollectionResult> {
        let outcome = channel.collect_garbage(scope.timestamp, deadline(self.budget))?;
        Ok(GarbageCollectionResult {
            completed: outcome.completed,
            swept: outcome.swept.len(),
        })
    }
}

/// Evict cached payloads beyond the cache budget.
#[derive(Debug)]
pub struct CacheCheckWork {
    pub budget: Option<Duration>,
}

impl TaskWork for CacheCheckWork {
    type Output = bool;

    fn kind(&self) -> TaskKind {
        TaskKind::CacheCheck
    }

    fn process(&self, _scope: &TaskScope<'_>, channel: &mut Channel) -> EngineResult<bool> {
        Ok(channel.check_cache(deadline(self.budget)))
    }
}

/// Dissolve data files the evaluator picks.
#[derive(Debug)]
pub struct FileCheckWork {
    pub budget: Option<Duration>,
}

impl TaskWork for FileCheckWork {
    type Output = bool;

    fn kind(&self) -> TaskKind {
        TaskKind::FileCheck
    }

    fn process(&self, _scope: &TaskScope<'_>, channel: &mut Channel) -> EngineResult<bool> {
        channel.check_files(deadline(self.budget))
    }
}

/// Copy every data file into a target directory.
#[derive(Debug)]
pub struct ExportWork {
    pub target: PathBuf,
}

impl TaskWork for ExportWork {
    type Output = Vec<ExportedFile>;

    fn kind(&self) -> TaskKind {
        TaskKind::Export
    }

    fn process(
        &self,
        _scope: &TaskScope<'_>,
        channel: &mut Channel,
    ) -> EngineResult<Vec<ExportedFile>> {
        channel.export(&self.target)
    }
}

#[derive(Debug)]
pub struct StatisticsWork;

impl TaskWork for StatisticsWork {
    type Output = ChannelStatistics;

    fn kind(&self) -> TaskKind {
        TaskKind::Statistics
    }

    fn process(
        &self,
        _scope: &TaskScope<'_>,
        channel: &mut Channel,
    ) -> EngineResult<ChannelStatistics> {
        Ok(channel.statistics())
    }
}

/// Does nothing; completes once every channel processed all earlier tasks.
#[derive(Debug)]
pub struct BarrierWork;

impl TaskWork for BarrierWork {
    type Output = ();

    fn kind(&self) -> TaskKind {
        TaskKind::Barrier
    }

    fn process(&self, _scope: &TaskScope<'_>, _channel: &mut Channel) -> EngineResult<()> {
        Ok(())
    }
}
