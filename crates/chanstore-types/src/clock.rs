use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Timestamp identifying one dispatched task.
///
/// Nanoseconds since the UNIX epoch, made strictly increasing by
/// [`TaskClock`]. Task timestamps are also written into every stored record,
/// so they must stay monotonic across restarts (see [`TaskClock::advance_past`]).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskTimestamp(u64);

impl TaskTimestamp {
    /// The zero timestamp. Never issued by a clock.
    pub const ZERO: Self = Self(0);

    pub const fn new(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskTimestamp({})", self.0)
    }
}

impl fmt::Display for TaskTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic source of [`TaskTimestamp`]s.
///
/// Follows the wall clock while it moves forward and falls back to a
/// `last + 1` counter whenever two requests land in the same nanosecond or
/// the wall clock steps backwards. Safe for concurrent use.
#[derive(Debug)]
pub struct TaskClock {
    last: Mutex<u64>,
}

impl TaskClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(0),
        }
    }

    /// Issue the next timestamp, strictly greater than every timestamp issued
    /// before by this clock.
    pub fn next(&self) -> TaskTimestamp {
        let wall = Self::wall_clock_ns();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let next = if wall > *last { wall } else { *last + 1 };
        *last = next;
        TaskTimestamp(next)
    }

    /// Make sure every future timestamp is strictly greater than `floor`.
    ///
    /// Used after initialization, when persisted records may carry
    /// timestamps from a clock that ran ahead of this one.
    pub fn advance_past(&self, floor: TaskTimestamp) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if floor.0 > *last {
            *last = floor.0;
        }
    }

    /// The most recently issued (or advanced-to) timestamp.
    pub fn last(&self) -> TaskTimestamp {
        TaskTimestamp(*self.last.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn wall_clock_ns() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }
}

impl Default for TaskClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Upper time bound for a piece of incremental work.
///
/// Budgets too large to be represented as an [`Instant`] (for example
/// `Duration::MAX` for a full garbage collection) produce an unbounded
/// deadline.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    bound: Option<Instant>,
}

impl Deadline {
    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            bound: Instant::now().checked_add(budget),
        }
    }

    /// A deadline that never expires.
    pub const fn unbounded() -> Self {
        Self { bound: None }
    }

    pub fn is_expired(&self) -> bool {
        self.bound.is_some_and(|bound| Instant::now() >= bound)
    }

    /// Time left until expiry, `None` if unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.bound
            .map(|bound| bound.saturating_duration_since(Instant::now()))
    }
}
