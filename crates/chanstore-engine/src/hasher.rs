use std::fmt;

use chanstore_types::{ChannelCount, ChannelIndex, EntityId};

/// Maps entities to the channel that owns them.
///
/// The mapping must be stable across restarts: an entity's records are only
/// ever read back by the channel it hashes to.
pub trait ChannelHasher: Send + Sync + fmt::Debug {
    fn channel_of(&self, entity: EntityId, channel_count: ChannelCount) -> ChannelIndex;
}

/// `entity id % channel count`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModuloHasher;

impl ChannelHasher for ModuloHasher {
    fn channel_of(&self, entity: EntityId, channel_count: ChannelCount) -> ChannelIndex {
        // Channel counts are powers of two.
        ChannelIndex::new((entity.get() & u64::from(channel_count.get() - 1)) as u32)
    }
}
