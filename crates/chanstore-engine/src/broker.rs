use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use chanstore_types::{ChannelCount, TaskClock, TaskTimestamp};

use crate::channel::Mailbox;
use crate::controller::OperationController;
use crate::error::{EngineError, EngineResult};
use crate::task::{ChannelTask, Task, TaskWork};

/// Creates tasks and hands each one to every channel.
///
/// One lock covers timestamp issue and dispatch, so every channel receives
/// the tasks in the same order and in timestamp order.
#[derive(Debug)]
pub struct TaskBroker {
    channel_count: ChannelCount,
    controller: Arc<OperationController>,
    clock: TaskClock,
    mailboxes: Vec<Arc<Mailbox>>,
    dispatch: Mutex<()>,
}

impl TaskBroker {
    pub fn new(
        channel_count: ChannelCount,
        controller: Arc<OperationController>,
        mailboxes: Vec<Arc<Mailbox>>,
    ) -> EngineResult<Self> {
        if mailboxes.len() != channel_count.as_usize() {
            return Err(EngineError::ChannelCountMismatch {
                expected: channel_count.as_usize(),
                actual: mailboxes.len(),
            });
        }
        Ok(Self {
            channel_count,
            controller,
            clock: TaskClock::new(),
            mailboxes,
            dispatch: Mutex::new(()),
        })
    }

    pub fn channel_count(&self) -> ChannelCount {
        self.channel_count
    }

    pub fn clock(&self) -> &TaskClock {
        &self.clock
    }

    /// Whether new tasks are accepted.
    pub fn is_accepting_tasks(&self) -> bool {
        self.controller.is_channel_processing_enabled()
    }

    fn ensure_accepting(&self) -> EngineResult<()> {
        if self.controller.check_processing_enabled()? {
            Ok(())
        } else {
            Err(EngineError::NotAccepting)
        }
    }

    /// Issue the initialization task. The only task accepted while channel
    /// processing is still disabled.
    pub fn issue_initialization<W: TaskWork>(&self, work: W) -> Arc<Task<W>> {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        self.dispatch_new(work)
    }

    pub fn issue<W: TaskWork>(&self, work: W) -> EngineResult<Arc<Task<W>>> {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_accepting()?;
        Ok(self.dispatch_new(work))
    }

    /// Issue two tasks back to back, with nothing in between on any channel.
    ///
    /// The first task gets the smaller timestamp.
    pub fn issue_pair<A: TaskWork, B: TaskWork>(
        &self,
        first: A,
        second: B,
    ) -> EngineResult<(Arc<Task<A>>, Arc<Task<B>>)> {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_accepting()?;
        let first = self.dispatch_new(first);
        let second = self.dispatch_new(second);
        Ok((first, second))
    }

    /// Make every later timestamp greater than `floor`.
    pub fn advance_clock_past(&self, floor: TaskTimestamp) {
        self.clock.advance_past(floor);
    }

    /// Stop delivering tasks to all channels.
    pub fn close_mailboxes(&self) {
        for mailbox in &self.mailboxes {
            mailbox.close();
        }
    }

    fn dispatch_new<W: TaskWork>(&self, work: W) -> Arc<Task<W>> {
        let task = Arc::new(Task::new(self.clock.next(), self.channel_count, work));
        debug!(
            kind = %task.progress().kind(),
            timestamp = %task.progress().timestamp(),
            "task issued",
        );
        for (index, mailbox) in self.channel_count.indices().zip(&self.mailboxes) {
            let shared: Arc<dyn ChannelTask> = task.clone();
            if !mailbox.send(shared) {
                task.progress()
                    .fail_channel(index, EngineError::ChannelStopped(index).into_problem());
            }
        }
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelWorker};
    use crate::config::HousekeepingConfig;
    use crate::controller::LivenessSignal;
    use crate::cache::InMemoryEntityCache;
    use crate::files::ChannelFileManager;
    use crate::task::work::{BarrierWork, InitializeWork};
    use chanstore_file::{DataFileEvaluator, FileProvider, MemoryFileProvider};

    fn workers(count: ChannelCount, controller: &Arc<OperationController>) -> Vec<ChannelWorker> {
        let provider: Arc<dyn FileProvider> = Arc::new(MemoryFileProvider::new());
        count
            .indices()
            .map(|index| {
                let files = ChannelFileManager::new(
                    index,
                    Arc::clone(&provider),
                    DataFileEvaluator::default(),
                    None,
                );
                let channel = Channel::new(
                    index,
                    Arc::clone(controller),
                    Box::new(InMemoryEntityCache::new(1 << 20)),
                    files,
                    HousekeepingConfig::default(),
                );
                ChannelWorker::spawn(channel).unwrap()
            })
            .collect()
    }

    fn broker(
        count: ChannelCount,
        controller: &Arc<OperationController>,
        workers: &[ChannelWorker],
    ) -> TaskBroker {
        let mailboxes = workers.iter().map(|w| Arc::clone(w.mailbox())).collect();
        TaskBroker::new(count, Arc::clone(controller), mailboxes).unwrap()
    }

    #[test]
    fn rejects_work_before_initialization() {
        let count = ChannelCount::new(2).unwrap();
        let controller = Arc::new(OperationController::new(LivenessSignal::new()));
        let workers = workers(count, &controller);
        let broker = broker(count, &controller, &workers);

        assert!(!broker.is_accepting_tasks());
        assert!(matches!(broker.issue(BarrierWork), Err(EngineError::NotAccepting)));

        let init = broker.issue_initialization(InitializeWork);
        assert_eq!(init.wait_for_results().unwrap().len(), 2);
        assert!(broker.is_accepting_tasks());
        broker.issue(BarrierWork).unwrap().wait_on_completion().unwrap();

        controller.deactivate();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn paired_tasks_are_ordered() {
        let count = ChannelCount::new(4).unwrap();
        let controller = Arc::new(OperationController::new(LivenessSignal::new()));
        let workers = workers(count, &controller);
        let broker = broker(count, &controller, &workers);
        broker.issue_initialization(InitializeWork).wait_on_completion().unwrap();

        let (first, second) = broker.issue_pair(BarrierWork, BarrierWork).unwrap();
        second.wait_on_completion().unwrap();
        assert!(first.is_complete());
        assert!(first.progress().timestamp() < second.progress().timestamp());

        controller.deactivate();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn closed_mailboxes_fail_the_task_instead_of_hanging() {
        let count = ChannelCount::new(2).unwrap();
        let controller = Arc::new(OperationController::new(LivenessSignal::new()));
        let workers = workers(count, &controller);
        let broker = broker(count, &controller, &workers);
        broker.issue_initialization(InitializeWork).wait_on_completion().unwrap();

        broker.close_mailboxes();
        let task = broker.issue(BarrierWork).unwrap();
        let err = task.wait_on_completion().unwrap_err();
        assert!(err.to_string().contains("not running"));

        controller.deactivate();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn mailbox_count_must_match() {
        let controller = Arc::new(OperationController::new(LivenessSignal::new()));
        assert!(matches!(
            TaskBroker::new(ChannelCount::new(2).unwrap(), controller, Vec::new()),
            Err(EngineError::ChannelCountMismatch { expected: 2, actual: 0 })
        ));
    }

    #[test]
    fn clock_advances_past_floor() {
        let controller = Arc::new(OperationController::new(LivenessSignal::new()));
        let workers = workers(ChannelCount::ONE, &controller);
        let broker = broker(ChannelCount::ONE, &controller, &workers);

        let floor = TaskTimestamp::new(u64::MAX / 2);
        broker.advance_clock_past(floor);
        let init = broker.issue_initialization(InitializeWork);
        assert!(init.progress().timestamp() > floor);
        init.wait_on_completion().unwrap();

        controller.deactivate();
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
