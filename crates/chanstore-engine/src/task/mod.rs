//! Tasks dispatched identically to every channel.
//!
//! A [`Task`] pairs a piece of channel work ([`TaskWork`]) with its fan-in
//! tracker ([`TaskProgress`]). The broker hands the same task to all channel
//! threads; each runs [`ChannelTask::process_by`] exactly once, and the
//! dispatcher collects the per-channel results or one aggregated failure.

mod progress;
pub mod work;

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::debug;

use chanstore_types::{ChannelCount, TaskTimestamp};

use crate::channel::Channel;
use crate::error::{EngineResult, TaskError};

pub use progress::TaskProgress;

/// What a task does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Initialize,
    Shutdown,
    Store,
    Load,
    GarbageCollection,
    CacheCheck,
    FileCheck,
    Export,
    Statistics,
    Barrier,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::Shutdown => "shutdown",
            Self::Store => "store",
            Self::Load => "load",
            Self::GarbageCollection => "garbage-collection",
            Self::CacheCheck => "cache-check",
            Self::FileCheck => "file-check",
            Self::Export => "export",
            Self::Statistics => "statistics",
            Self::Barrier => "barrier",
        };
        f.write_str(name)
    }
}

/// Context handed to a task's work on each channel.
pub struct TaskScope<'a> {
    pub timestamp: TaskTimestamp,
    pub progress: &'a TaskProgress,
}

/// Channel-specific work of one task kind.
pub trait TaskWork: Send + Sync + 'static {
    type Output: Send + 'static;

    fn kind(&self) -> TaskKind;

    /// The channel's share of the work. A failure here is recorded as the
    /// channel's problem and never blocks the other channels.
    fn process(&self, scope: &TaskScope<'_>, channel: &mut Channel) -> EngineResult<Self::Output>;

    /// Runs after successful processing. A failure here escapes the task
    /// protocol and is handled by the channel as a disruption.
    fn complete(
        &self,
        _scope: &TaskScope<'_>,
        _channel: &mut Channel,
        output: Self::Output,
    ) -> EngineResult<Self::Output> {
        Ok(output)
    }

    /// Runs last on every channel, whatever the outcome.
    fn clean_up(&self, _channel: &mut Channel) {}
}

/// Object-safe view of a task, as seen by channel threads.
pub trait ChannelTask: Send + Sync {
    fn kind(&self) -> TaskKind;

    fn timestamp(&self) -> TaskTimestamp;

    fn progress(&self) -> &TaskProgress;

    /// Run this task on `channel`. Called once per channel, on that channel's thread.
    ///
    /// Returns an error only when the completion step failed; processing
    /// failures are recorded in the task's progress instead.
    fn process_by(&self, channel: &mut Channel) -> EngineResult<()>;
}

/// A unit of work dispatched to all channels, with its per-channel results.
pub struct Task<W: TaskWork> {
    timestamp: TaskTimestamp,
    work: W,
    progress: TaskProgress,
    results: Mutex<Option<Vec<Option<W::Output>>>>,
}

impl<W: TaskWork> Task<W> {
    pub fn new(timestamp: TaskTimestamp, channel_count: ChannelCount, work: W) -> Self {
        let kind = work.kind();
        Self {
            timestamp,
            work,
            progress: TaskProgress::new(kind, timestamp, channel_count),
            results: Mutex::new(Some(
                (0..channel_count.as_usize()).map(|_| None).collect(),
            )),
        }
    }

    pub fn work(&self) -> &W {
        &self.work
    }

    pub fn wait_on_completion(&self) -> Result<(), TaskError> {
        self.progress.wait_on_completion()
    }

    pub fn is_complete(&self) -> bool {
        self.progress.is_complete()
    }

    pub fn has_problems(&self) -> bool {
        self.progress.has_problems()
    }

    /// Wait for all channels and take their results, ordered by channel index.
    ///
    /// Either the full result set or the aggregated failure is returned, and
    /// the results can be taken only once.
    pub fn wait_for_results(&self) -> Result<Vec<W::Output>, TaskError> {
        self.progress.wait_on_completion()?;
        let results = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TaskError::ResultsTaken(self.timestamp))?;
        // Without problems every channel stored its output.
        Ok(results.into_iter().flatten().collect())
    }

    fn store_result(&self, channel: usize, output: W::Output) {
        if let Some(results) = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            results[channel] = Some(output);
        }
    }
}

impl<W: TaskWork> ChannelTask for Task<W> {
    fn kind(&self) -> TaskKind {
        self.progress.kind()
    }

    fn timestamp(&self) -> TaskTimestamp {
        self.timestamp
    }

    fn progress(&self) -> &TaskProgress {
        &self.progress
    }

    fn process_by(&self, channel: &mut Channel) -> EngineResult<()> {
        let index = channel.index();
        let scope = TaskScope {
            timestamp: self.timestamp,
            progress: &self.progress,
        };
        debug!(
            channel = index.get(),
            kind = %self.kind(),
            timestamp = %self.timestamp,
            "processing task",
        );

        let outcome = match self.work.process(&scope, channel) {
            Ok(output) => {
                self.progress.finish_processing(index);
                self.work
                    .complete(&scope, channel, output)
                    .map(|output| {
                        self.store_result(index.as_usize(), output);
                        self.progress.increment_completion(index);
                    })
            }
            Err(e) => {
                debug!(
                    channel = index.get(),
                    kind = %self.kind(),
                    error = %e,
                    "task failed on channel",
                );
                self.progress.add_problem(index, e.into_problem());
                self.progress.finish_processing(index);
                self.progress.increment_completion(index);
                Ok(())
            }
        };

        self.work.clean_up(channel);
        outcome
    }
}

impl<W: TaskWork> fmt::Debug for Task<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind())
            .field("timestamp", &self.timestamp)
            .field("complete", &self.is_complete())
            .finish()
    }
}
