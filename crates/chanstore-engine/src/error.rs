use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chanstore_backup::BackupError;
use chanstore_file::FileError;
use chanstore_types::{ChannelIndex, EntityId, TaskTimestamp, TypeError};

use crate::task::TaskKind;

/// A channel-reported error.
///
/// Shared so the same error can sit in a task's problem slot and in the
/// controller's disruption list at once.
pub type Problem = Arc<dyn Error + Send + Sync + 'static>;

/// Every problem one channel reported for one task.
#[derive(Clone, Debug)]
pub struct ChannelProblem {
    pub channel: ChannelIndex,
    pub primary: Problem,
    /// Problems reported after the first one, in report order.
    pub suppressed: Vec<Problem>,
}

/// Aggregated failure of a task, covering every channel that reported a problem.
#[derive(Clone, Debug)]
pub struct AggregateProblems {
    pub kind: TaskKind,
    pub timestamp: TaskTimestamp,
    /// Ascending by channel index.
    pub problems: Vec<ChannelProblem>,
}

impl AggregateProblems {
    pub fn channels(&self) -> impl Iterator<Item = ChannelIndex> + '_ {
        self.problems.iter().map(|p| p.channel)
    }

    pub fn problem_of(&self, channel: ChannelIndex) -> Option<&ChannelProblem> {
        self.problems.iter().find(|p| p.channel == channel)
    }
}

impl fmt::Display for AggregateProblems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} task {} failed on {} channel(s)",
            self.kind,
            self.timestamp,
            self.problems.len()
        )?;
        for problem in &self.problems {
            write!(f, "; {}: {}", problem.channel, problem.primary)?;
            if !problem.suppressed.is_empty() {
                write!(f, " (+{} suppressed)", problem.suppressed.len())?;
            }
        }
        Ok(())
    }
}

impl Error for AggregateProblems {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.problems
            .first()
            .map(|p| p.primary.as_ref() as &(dyn Error + 'static))
    }
}

/// One disruption registered with the operation controller.
#[derive(Clone, Debug)]
pub struct Disruption {
    /// Reporting channel, `None` for the backup thread or the system itself.
    pub channel: Option<ChannelIndex>,
    pub error: Problem,
}

impl fmt::Display for Disruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Some(channel) => write!(f, "{channel}: {}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

/// All disruptions registered so far, in registration order.
#[derive(Clone, Debug)]
pub struct DisruptionReport {
    pub disruptions: Vec<Disruption>,
}

impl fmt::Display for DisruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} disruption(s)", self.disruptions.len())?;
        for disruption in &self.disruptions {
            write!(f, "; {disruption}")?;
        }
        Ok(())
    }
}

impl Error for DisruptionReport {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.disruptions
            .first()
            .map(|d| d.error.as_ref() as &(dyn Error + 'static))
    }
}

/// Errors surfaced by a task to its dispatcher.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TaskError {
    /// One or more channels failed.
    #[error(transparent)]
    Failed(AggregateProblems),

    /// The task's results were already retrieved.
    #[error("results of task {0} were already taken")]
    ResultsTaken(TaskTimestamp),
}

/// Errors produced by the channel engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Processing was halted by one or more disruptions.
    #[error("storage processing disrupted: {0}")]
    Disrupted(DisruptionReport),

    #[error(transparent)]
    Task(#[from] TaskError),

    /// The storage system does not accept new tasks.
    #[error("storage system is not accepting tasks")]
    NotAccepting,

    /// A task reached a channel that has already stopped.
    #[error("{0} is not running")]
    ChannelStopped(ChannelIndex),

    /// A per-channel request did not carry one slice per channel.
    #[error("expected {expected} channel slices, got {actual}")]
    ChannelCountMismatch { expected: usize, actual: usize },

    /// A payload does not fit the record length field.
    #[error("payload of entity {entity} is {length} bytes, more than a record can hold")]
    PayloadTooLarge { entity: EntityId, length: usize },

    /// A record failed its integrity check.
    #[error("corrupt record in {file} at {position}: {reason}")]
    CorruptRecord {
        file: String,
        position: u64,
        reason: String,
    },

    /// An entity cache refers to a data file the channel does not know.
    #[error("{channel} has no data file {number}")]
    UnknownFile { channel: ChannelIndex, number: u64 },

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A worker thread panicked.
    #[error("thread {0} panicked")]
    ThreadPanicked(String),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap this error as a shareable [`Problem`].
    pub fn into_problem(self) -> Problem {
        Arc::new(self)
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
