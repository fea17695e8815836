use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use chanstore_types::{ChannelCount, ChannelIndex, TaskTimestamp};

use crate::error::{AggregateProblems, ChannelProblem, Problem, TaskError};
use crate::task::TaskKind;

#[derive(Debug)]
struct ProblemSlot {
    primary: Problem,
    suppressed: Vec<Problem>,
}

#[derive(Debug)]
struct ProgressState {
    remaining_for_completion: usize,
    remaining_for_processing: usize,
    completed: Vec<bool>,
    processed: Vec<bool>,
    problems: Vec<Option<ProblemSlot>>,
    has_problems: bool,
}

/// Fan-in tracker of one task across all channels.
///
/// Each channel reports exactly once that it finished raw processing and
/// exactly once that it completed; reporting either twice is a programming
/// error and panics. Problems go into one slot per channel: the first is
/// kept as primary, later ones are attached as suppressed.
///
/// Counters and slots are guarded by one lock, and every change wakes all
/// waiters.
#[derive(Debug)]
pub struct TaskProgress {
    kind: TaskKind,
    timestamp: TaskTimestamp,
    state: Mutex<ProgressState>,
    changed: Condvar,
}

impl TaskProgress {
    pub fn new(kind: TaskKind, timestamp: TaskTimestamp, channel_count: ChannelCount) -> Self {
        let n = channel_count.as_usize();
        Self {
            kind,
            timestamp,
            state: Mutex::new(ProgressState {
                remaining_for_completion: n,
                remaining_for_processing: n,
                completed: vec![false; n],
                processed: vec![false; n],
                problems: (0..n).map(|_| None).collect(),
                has_problems: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn timestamp(&self) -> TaskTimestamp {
        self.timestamp
    }

    fn state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a problem reported by `channel`.
    pub fn add_problem(&self, channel: ChannelIndex, problem: Problem) {
        let mut state = self.state();
        Self::store_problem(&mut state, channel, problem);
        self.changed.notify_all();
    }

    /// Mark the raw processing of `channel` as finished.
    ///
    /// # Panics
    ///
    /// If `channel` already finished processing this task.
    pub fn finish_processing(&self, channel: ChannelIndex) {
        let mut state = self.state();
        let slot = &mut state.processed[channel.as_usize()];
        assert!(!*slot, "{channel} finished processing task {} twice", self.timestamp);
        *slot = true;
        state.remaining_for_processing -= 1;
        self.changed.notify_all();
    }

    /// Mark `channel` as completed.
    ///
    /// # Panics
    ///
    /// If `channel` already completed this task.
    pub fn increment_completion(&self, channel: ChannelIndex) {
        let mut state = self.state();
        let slot = &mut state.completed[channel.as_usize()];
        assert!(!*slot, "{channel} completed task {} twice", self.timestamp);
        *slot = true;
        state.remaining_for_completion -= 1;
        if state.remaining_for_completion == 0 {
            debug!(kind = %self.kind, timestamp = %self.timestamp, "task complete");
        }
        self.changed.notify_all();
    }

    /// Record `problem` for `channel` and count whatever it has not reported yet.
    ///
    /// Used when a channel fails outside the regular protocol (a failing
    /// completion step, or a task that reached a stopped channel), so that
    /// no waiter is left behind.
    pub fn fail_channel(&self, channel: ChannelIndex, problem: Problem) {
        let mut state = self.state();
        let i = channel.as_usize();
        Self::store_problem(&mut state, channel, problem);
        if !state.processed[i] {
            state.processed[i] = true;
            state.remaining_for_processing -= 1;
        }
        if !state.completed[i] {
            state.completed[i] = true;
            state.remaining_for_completion -= 1;
        }
        self.changed.notify_all();
    }

    fn store_problem(state: &mut ProgressState, channel: ChannelIndex, problem: Problem) {
        let slot = &mut state.problems[channel.as_usize()];
        match slot {
            Some(existing) => existing.suppressed.push(problem),
            None => {
                *slot = Some(ProblemSlot {
                    primary: problem,
                    suppressed: Vec::new(),
                })
            }
        }
        state.has_problems = true;
    }

    /// Block until every channel reported completion.
    ///
    /// Problems are checked before every wait and after every wake-up; once
    /// one is present the aggregated failure of the problems registered so
    /// far is returned without waiting for the remaining channels.
    pub fn wait_on_completion(&self) -> Result<(), TaskError> {
        let mut state = self.state();
        loop {
            if state.has_problems {
                return Err(self.aggregate(&state));
            }
            if state.remaining_for_completion == 0 {
                return Ok(());
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until every channel finished raw processing.
    ///
    /// Like [`wait_on_completion`](Self::wait_on_completion) this returns
    /// the aggregated failure as soon as any problem is registered, so a
    /// channel waiting here is never stranded by a failed peer.
    pub fn wait_for_processing(&self) -> Result<(), TaskError> {
        let mut state = self.state();
        loop {
            if state.has_problems {
                return Err(self.aggregate(&state));
            }
            if state.remaining_for_processing == 0 {
                return Ok(());
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state().remaining_for_completion == 0
    }

    pub fn has_problems(&self) -> bool {
        self.state().has_problems
    }

    pub fn remaining_for_completion(&self) -> usize {
        self.state().remaining_for_completion
    }

    pub fn remaining_for_processing(&self) -> usize {
        self.state().remaining_for_processing
    }

    /// Snapshot of all non-empty problem slots, ascending by channel.
    pub fn problems(&self) -> Vec<ChannelProblem> {
        Self::collect_problems(&self.state())
    }

    fn collect_problems(state: &ProgressState) -> Vec<ChannelProblem> {
        state
            .problems
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref().map(|slot| ChannelProblem {
                    channel: ChannelIndex::new(i as u32),
                    primary: slot.primary.clone(),
                    suppressed: slot.suppressed.clone(),
                })
            })
            .collect()
    }

    fn aggregate(&self, state: &ProgressState) -> TaskError {
        TaskError::Failed(AggregateProblems {
            kind: self.kind,
            timestamp: self.timestamp,
            problems: Self::collect_problems(state),
        })
    }
}
