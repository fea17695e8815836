use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Index of one channel, in `[0, channel_count)`.
///
/// A channel owns exactly one shard of the persisted object graph for the
/// whole process lifetime; the index never changes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelIndex(u32);

impl ChannelIndex {
    /// Create an index without range validation.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// The index as a slot position for per-channel arrays.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ChannelIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelIndex({})", self.0)
    }
}

impl fmt::Display for ChannelIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

/// Total number of channels in a storage system.
///
/// Must be a power of two so that entity ids can be mapped to channels with
/// a simple mask, and may not exceed [`ChannelCount::MAX`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ChannelCount(u32);

impl ChannelCount {
    /// Upper bound for the number of channels.
    pub const MAX: u32 = 1024;

    /// A single channel.
    pub const ONE: Self = Self(1);

    /// Validate and wrap a channel count.
    pub fn new(count: u32) -> Result<Self, TypeError> {
        if count == 0 || count > Self::MAX || !count.is_power_of_two() {
            return Err(TypeError::InvalidChannelCount(count));
        }
        Ok(Self(count))
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Validate that `index` addresses one of these channels.
    pub fn index(self, index: u32) -> Result<ChannelIndex, TypeError> {
        if index >= self.0 {
            return Err(TypeError::ChannelIndexOutOfRange {
                index,
                count: self.0,
            });
        }
        Ok(ChannelIndex(index))
    }

    /// Iterate over all channel indices in ascending order.
    pub fn indices(self) -> impl Iterator<Item = ChannelIndex> {
        (0..self.0).map(ChannelIndex)
    }
}

impl TryFrom<u32> for ChannelCount {
    type Error = TypeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChannelCount> for u32 {
    fn from(count: ChannelCount) -> Self {
        count.0
    }
}

impl fmt::Debug for ChannelCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelCount({})", self.0)
    }
}

impl fmt::Display for ChannelCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number of a data file within one channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileNumber(u64);

impl FileNumber {
    /// Number assigned to the very first data file of a channel.
    pub const FIRST: Self = Self(1);

    pub const fn new(number: u64) -> Self {
        Self(number)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The number following this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for FileNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileNumber({})", self.0)
    }
}

impl fmt::Display for FileNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a persisted entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_USER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a logical consumer of an open file.
///
/// Channels, the backup thread, exporters and the garbage collector each hold
/// their own `UserId`. Identities are process-unique and never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(u64);

impl UserId {
    /// Allocate a new, process-unique user identity.
    pub fn fresh() -> Self {
        Self(NEXT_USER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user#{}", self.0)
    }
}
