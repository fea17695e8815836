//! Channel state and the channel worker thread.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use chanstore_types::{ChannelIndex, Deadline, EntityId, TaskTimestamp};

use crate::cache::{EntityCache, GcOutcome};
use crate::config::HousekeepingConfig;
use crate::controller::OperationController;
use crate::error::{EngineError, EngineResult};
use crate::files::{ChannelFileManager, ChannelStatistics, ExportedFile, StorageInventory};
use crate::task::{ChannelTask, TaskKind};

/// State owned by one channel thread: its share of the entities and their files.
#[derive(Debug)]
pub struct Channel {
    index: ChannelIndex,
    controller: Arc<OperationController>,
    cache: Box<dyn EntityCache>,
    files: ChannelFileManager,
    housekeeping: HousekeepingConfig,
    /// Timestamp of the latest task seen, stamped onto housekeeping tombstones.
    last_task: TaskTimestamp,
}

impl Channel {
    pub fn new(
        index: ChannelIndex,
        controller: Arc<OperationController>,
        cache: Box<dyn EntityCache>,
        files: ChannelFileManager,
        housekeeping: HousekeepingConfig,
    ) -> Self {
        Self {
            index,
            controller,
            cache,
            files,
            housekeeping,
            last_task: TaskTimestamp::ZERO,
        }
    }

    pub fn index(&self) -> ChannelIndex {
        self.index
    }

    pub fn controller(&self) -> &OperationController {
        &self.controller
    }

    pub fn initialize_storage(&mut self) -> EngineResult<StorageInventory> {
        let inventory = self.files.initialize_storage(self.cache.as_mut())?;
        self.last_task = self.last_task.max(inventory.latest_timestamp);
        Ok(inventory)
    }

    pub fn store(
        &mut self,
        timestamp: TaskTimestamp,
        entities: &[(EntityId, Vec<u8>)],
    ) -> EngineResult<u64> {
        self.files.store(self.cache.as_mut(), timestamp, entities)
    }

    /// Mark entities as garbage. Returns how many were live.
    pub fn release(&mut self, entities: &[EntityId]) -> usize {
        entities.iter().filter(|id| self.cache.release(**id)).count()
    }

    pub fn load(
        &mut self,
        entities: &[EntityId],
    ) -> EngineResult<Vec<(EntityId, Option<Arc<[u8]>>)>> {
        entities
            .iter()
            .map(|id| {
                self.files
                    .load(self.cache.as_mut(), *id)
                    .map(|data| (*id, data))
            })
            .collect()
    }

    pub fn collect_garbage(
        &mut self,
        timestamp: TaskTimestamp,
        deadline: Deadline,
    ) -> EngineResult<GcOutcome> {
        self.files.collect_garbage(self.cache.as_mut(), timestamp, deadline)
    }

    pub fn check_cache(&mut self, deadline: Deadline) -> bool {
        self.cache.check_cache(deadline)
    }

    pub fn check_files(&mut self, deadline: Deadline) -> EngineResult<bool> {
        self.files.check_files(self.cache.as_mut(), deadline)
    }

    pub fn export(&self, target: &Path) -> EngineResult<Vec<ExportedFile>> {
        self.files.export(target)
    }

    pub fn statistics(&self) -> ChannelStatistics {
        self.files.statistics(self.cache.as_ref())
    }

    pub fn shut_down(&mut self) -> EngineResult<()> {
        self.files.shut_down()?;
        self.cache.reset();
        Ok(())
    }

    /// One budgeted round of file check, garbage collection and cache check.
    ///
    /// Does nothing before the channel's storage is initialized.
    pub fn housekeep(&mut self) -> EngineResult<()> {
        if !self.files.is_initialized() {
            return Ok(());
        }
        self.check_files(Deadline::after(self.housekeeping.file_check_budget()))?;
        self.collect_garbage(self.last_task, Deadline::after(self.housekeeping.gc_budget()))?;
        self.check_cache(Deadline::after(self.housekeeping.cache_check_budget()));
        Ok(())
    }
}

/// Sending side of a channel's task queue.
///
/// Closing it under the same lock that guards sending means no task can
/// slip in after the channel drained its queue on exit.
#[derive(Debug)]
pub struct Mailbox {
    sender: Mutex<Option<Sender<Arc<dyn ChannelTask>>>>,
}

impl Mailbox {
    fn new(sender: Sender<Arc<dyn ChannelTask>>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Hand `task` to the channel. Returns `false` if the channel stopped.
    pub fn send(&self, task: Arc<dyn ChannelTask>) -> bool {
        match self.sender.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(sender) => sender.send(task).is_ok(),
            None => false,
        }
    }

    pub fn close(&self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

/// A running channel thread.
#[derive(Debug)]
pub struct ChannelWorker {
    index: ChannelIndex,
    mailbox: Arc<Mailbox>,
    thread: JoinHandle<()>,
}

impl ChannelWorker {
    /// Start the thread of `channel`. It blocks until its first task arrives.
    pub fn spawn(channel: Channel) -> EngineResult<Self> {
        let index = channel.index();
        let (sender, receiver) = mpsc::channel();
        let mailbox = Arc::new(Mailbox::new(sender));
        let name = format!("chanstore-channel-{}", index.get());

        let thread_mailbox = Arc::clone(&mailbox);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(channel, receiver, &thread_mailbox))
            .map_err(|source| EngineError::Spawn { name, source })?;

        Ok(Self {
            index,
            mailbox,
            thread,
        })
    }

    pub fn index(&self) -> ChannelIndex {
        self.index
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn join(self) -> EngineResult<()> {
        self.mailbox.close();
        self.thread.join().map_err(|_| {
            EngineError::ThreadPanicked(format!("chanstore-channel-{}", self.index.get()))
        })
    }
}

fn run(mut channel: Channel, receiver: Receiver<Arc<dyn ChannelTask>>, mailbox: &Mailbox) {
    let index = channel.index();
    info!(channel = index.get(), "channel started");

    // The first task is processed before the enabled flag is consulted:
    // processing is only enabled by the initialization task itself.
    let mut next = receiver.recv().ok();
    loop {
        if let Some(task) = next.take() {
            if !process(&mut channel, task.as_ref()) {
                break;
            }
        }
        match channel.controller().check_processing_enabled() {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                debug!(channel = index.get(), error = %e, "channel halted by disruption");
                break;
            }
        }
        match receiver.recv_timeout(channel.housekeeping.interval()) {
            Ok(task) => next = Some(task),
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = channel.housekeep() {
                    channel
                        .controller()
                        .register_disruption(Some(index), e.into_problem());
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    mailbox.close();
    let stopped = EngineError::ChannelStopped(index).into_problem();
    while let Ok(task) = receiver.try_recv() {
        warn!(channel = index.get(), kind = %task.kind(), "task dropped by stopped channel");
        task.progress().fail_channel(index, Arc::clone(&stopped));
    }
    channel.files.release_files();
    info!(channel = index.get(), "channel stopped");
}

/// Run one task. Returns whether the channel keeps going.
fn process(channel: &mut Channel, task: &dyn ChannelTask) -> bool {
    channel.last_task = channel.last_task.max(task.timestamp());
    if let Err(e) = task.process_by(channel) {
        let problem = e.into_problem();
        channel
            .controller()
            .register_disruption(Some(channel.index()), Arc::clone(&problem));
        task.progress().fail_channel(channel.index(), problem);
        return false;
    }
    task.kind() != TaskKind::Shutdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryEntityCache;
    use crate::controller::LivenessSignal;
    use crate::task::work::{BarrierWork, InitializeWork, StoreSlice, StoreWork};
    use crate::task::Task;
    use chanstore_file::{DataFileEvaluator, FileProvider, MemoryFileProvider};
    use chanstore_types::ChannelCount;
    use std::time::Duration;

    fn channel(
        controller: &Arc<OperationController>,
        provider: &Arc<MemoryFileProvider>,
    ) -> Channel {
        let index = ChannelIndex::new(0);
        let provider: Arc<dyn FileProvider> = provider.clone();
        let files = ChannelFileManager::new(index, provider, DataFileEvaluator::default(), None);
        Channel::new(
            index,
            Arc::clone(controller),
            Box::new(InMemoryEntityCache::new(1 << 20)),
            files,
            HousekeepingConfig {
                interval_ms: 10,
                ..HousekeepingConfig::default()
            },
        )
    }

    fn initialize(worker: &ChannelWorker) {
        let task = Arc::new(Task::new(TaskTimestamp::new(1), ChannelCount::ONE, InitializeWork));
        assert!(worker.mailbox().send(task.clone()));
        task.wait_for_results().unwrap();
    }

    #[test]
    fn channel_processes_tasks_in_order_and_housekeeps() {
        let controller = Arc::new(OperationController::new(LivenessSignal::new()));
        let provider = Arc::new(MemoryFileProvider::new());
        let worker = ChannelWorker::spawn(channel(&controller, &provider)).unwrap();
        initialize(&worker);
        assert!(controller.is_active());

        let store = Arc::new(Task::new(
            TaskTimestamp::new(2),
            ChannelCount::ONE,
            StoreWork::new(vec![StoreSlice {
                entities: vec![(EntityId::new(1), b"one".to_vec())],
                releases: Vec::new(),
            }]),
        ));
        let barrier = Arc::new(Task::new(TaskTimestamp::new(3), ChannelCount::ONE, BarrierWork));
        assert!(worker.mailbox().send(store.clone()));
        assert!(worker.mailbox().send(barrier.clone()));
        barrier.wait_on_completion().unwrap();
        assert!(store.is_complete());
        assert_eq!(store.wait_for_results().unwrap()[0].entities, 1);

        // Idle long enough for a few housekeeping rounds.
        thread::sleep(Duration::from_millis(50));
        assert!(!controller.has_disruptions());

        controller.deactivate();
        worker.join().unwrap();
    }

    #[test]
    fn tasks_sent_to_stopped_channel_are_rejected() {
        let controller = Arc::new(OperationController::new(LivenessSignal::new()));
        let provider = Arc::new(MemoryFileProvider::new());
        let worker = ChannelWorker::spawn(channel(&controller, &provider)).unwrap();
        initialize(&worker);

        controller.deactivate();
        let mailbox = Arc::clone(worker.mailbox());
        worker.join().unwrap();

        assert!(mailbox.is_closed());
        let late = Arc::new(Task::new(TaskTimestamp::new(9), ChannelCount::ONE, BarrierWork));
        assert!(!mailbox.send(late));
    }

    #[test]
    fn failing_completion_disrupts_and_releases_dispatcher() {
        use crate::task::{TaskScope, TaskWork};

        struct FailingCompletion;

        impl TaskWork for FailingCompletion {
            type Output = ();

            fn kind(&self) -> TaskKind {
                TaskKind::Barrier
            }

            fn process(&self, _scope: &TaskScope<'_>, _channel: &mut Channel) -> EngineResult<()> {
                Ok(())
            }

            fn complete(
                &self,
                _scope: &TaskScope<'_>,
                _channel: &mut Channel,
                _output: (),
            ) -> EngineResult<()> {
                Err(EngineError::Config("completion failed".to_string()))
            }
        }

        let controller = Arc::new(OperationController::new(LivenessSignal::new()));
        let provider = Arc::new(MemoryFileProvider::new());
        let worker = ChannelWorker::spawn(channel(&controller, &provider)).unwrap();
        initialize(&worker);

        let task = Arc::new(Task::new(TaskTimestamp::new(2), ChannelCount::ONE, FailingCompletion));
        assert!(worker.mailbox().send(task.clone()));
        let err = task.wait_on_completion().unwrap_err();
        assert!(err.to_string().contains("completion failed"));

        worker.join().unwrap();
        assert_eq!(controller.disruptions().len(), 1);
        assert_eq!(controller.disruptions()[0].channel, Some(ChannelIndex::new(0)));
    }
}
