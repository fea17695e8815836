use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use chanstore_types::{Deadline, EntityId, FileNumber};

use crate::record::RecordKind;

/// Where the current record of an entity lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLocation {
    pub file: FileNumber,
    /// Offset of the record start.
    pub position: u64,
    /// Total record length, header included.
    pub length: u64,
}

/// A record the cache still considers live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveRecord {
    pub entity: EntityId,
    pub kind: RecordKind,
    pub location: EntityLocation,
}

/// Outcome of one budgeted garbage collection step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcOutcome {
    /// Whether all pending garbage was handled within the budget.
    pub completed: bool,
    /// Released entities swept in this step. Each needs a tombstone record.
    pub swept: Vec<EntityId>,
}

/// Per-channel index of the entities a channel owns.
///
/// The cache maps every entity to the location of its current record and may
/// keep entity payloads in memory. Which entities are garbage is decided by
/// callers through [`release`](EntityCache::release); the cache only sweeps
/// what was released.
pub trait EntityCache: Send + fmt::Debug {
    /// Location of the current record of a live, unreleased entity.
    fn locate(&self, entity: EntityId) -> Option<EntityLocation>;

    /// Make `location` the current record of `entity`.
    ///
    /// Returns the location of the record it supersedes, which from now on
    /// is dead space in its file.
    fn register(
        &mut self,
        entity: EntityId,
        kind: RecordKind,
        location: EntityLocation,
    ) -> Option<EntityLocation>;

    /// Move the current record of `entity` to `location` without changing
    /// its state. Returns the old location, `None` for unknown entities.
    fn relocate(&mut self, entity: EntityId, location: EntityLocation) -> Option<EntityLocation>;

    /// Mark a live entity as garbage. It stays registered until swept.
    fn release(&mut self, entity: EntityId) -> bool;

    /// Every live record stored in `file`.
    fn live_records(&self, file: FileNumber) -> Vec<LiveRecord>;

    /// Cached payload of `entity`, if any.
    fn cached_data(&mut self, entity: EntityId) -> Option<Arc<[u8]>>;

    /// Keep `data` in memory as the payload of `entity`.
    fn cache_data(&mut self, entity: EntityId, data: Arc<[u8]>);

    /// Sweep released entities until `deadline` expires.
    fn collect_garbage(&mut self, deadline: Deadline) -> GcOutcome;

    /// Evict cached payloads beyond the cache's memory budget until
    /// `deadline` expires. Returns whether the budget is met.
    fn check_cache(&mut self, deadline: Deadline) -> bool;

    /// Number of live, unreleased entities.
    fn entity_count(&self) -> usize;

    /// Bytes of payload currently held in memory.
    fn cached_bytes(&self) -> u64;

    /// Drop everything.
    fn reset(&mut self);
}

#[derive(Debug)]
enum Entry {
    Live {
        location: EntityLocation,
        released: bool,
        data: Option<Arc<[u8]>>,
        touched: u64,
    },
    Tombstone {
        location: EntityLocation,
    },
}

impl Entry {
    fn location(&self) -> EntityLocation {
        match self {
            Self::Live { location, .. } | Self::Tombstone { location } => *location,
        }
    }

    fn kind(&self) -> RecordKind {
        match self {
            Self::Live { .. } => RecordKind::Entity,
            Self::Tombstone { .. } => RecordKind::Tombstone,
        }
    }
}

/// `HashMap`-based [`EntityCache`].
///
/// Payloads loaded or stored are kept in memory up to `byte_limit`; the cache
/// check evicts the least recently touched ones beyond it.
pub struct InMemoryEntityCache {
    entries: HashMap<EntityId, Entry>,
    released: VecDeque<EntityId>,
    byte_limit: u64,
    cached_bytes: u64,
    tick: u64,
}

impl InMemoryEntityCache {
    pub fn new(byte_limit: u64) -> Self {
        Self {
            entries: HashMap::new(),
            released: VecDeque::new(),
            byte_limit,
            cached_bytes: 0,
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn drop_data(&mut self, data: Option<Arc<[u8]>>) {
        if let Some(data) = data {
            self.cached_bytes -= data.len() as u64;
        }
    }
}

impl fmt::Debug for InMemoryEntityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEntityCache")
            .field("entries", &self.entries.len())
            .field("released", &self.released.len())
            .field("cached_bytes", &self.cached_bytes)
            .field("byte_limit", &self.byte_limit)
            .finish()
    }
}

impl EntityCache for InMemoryEntityCache {
    fn locate(&self, entity: EntityId) -> Option<EntityLocation> {
        match self.entries.get(&entity)? {
            Entry::Live {
                location,
                released: false,
                ..
            } => Some(*location),
            _ => None,
        }
    }

    fn register(
        &mut self,
        entity: EntityId,
        kind: RecordKind,
        location: EntityLocation,
    ) -> Option<EntityLocation> {
        let entry = match kind {
            RecordKind::Entity => Entry::Live {
                location,
                released: false,
                data: None,
                touched: self.next_tick(),
            },
            RecordKind::Tombstone => Entry::Tombstone { location },
        };
        let previous = self.entries.insert(entity, entry)?;
        let superseded = previous.location();
        if let Entry::Live { data, .. } = previous {
            self.drop_data(data);
        }
        Some(superseded)
    }

    fn relocate(&mut self, entity: EntityId, location: EntityLocation) -> Option<EntityLocation> {
        match self.entries.get_mut(&entity)? {
            Entry::Live { location: current, .. } | Entry::Tombstone { location: current } => {
                Some(std::mem::replace(current, location))
            }
        }
    }

    fn release(&mut self, entity: EntityId) -> bool {
        match self.entries.get_mut(&entity) {
            Some(Entry::Live { released, .. }) if !*released => {
                *released = true;
                self.released.push_back(entity);
                true
            }
            _ => false,
        }
    }

    fn live_records(&self, file: FileNumber) -> Vec<LiveRecord> {
        let mut records: Vec<LiveRecord> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.location().file == file)
            .map(|(entity, entry)| LiveRecord {
                entity: *entity,
                kind: entry.kind(),
                location: entry.location(),
            })
            .collect();
        records.sort_by_key(|r| r.location.position);
        records
    }

    fn cached_data(&mut self, entity: EntityId) -> Option<Arc<[u8]>> {
        let tick = self.next_tick();
        match self.entries.get_mut(&entity)? {
            Entry::Live {
                data: Some(data),
                touched,
                released: false,
                ..
            } => {
                *touched = tick;
                Some(Arc::clone(data))
            }
            _ => None,
        }
    }

    fn cache_data(&mut self, entity: EntityId, data: Arc<[u8]>) {
        let tick = self.next_tick();
        let added = data.len() as u64;
        let Some(Entry::Live {
            data: slot,
            touched,
            ..
        }) = self.entries.get_mut(&entity)
        else {
            return;
        };
        let replaced = slot.replace(data);
        *touched = tick;
        self.drop_data(replaced);
        self.cached_bytes += added;
    }

    fn collect_garbage(&mut self, deadline: Deadline) -> GcOutcome {
        let mut swept = Vec::new();
        let mut seen = HashSet::new();
        while !deadline.is_expired() {
            let Some(entity) = self.released.pop_front() else {
                break;
            };
            // A released entity stored again in the meantime is alive.
            if let Some(Entry::Live { released: true, .. }) = self.entries.get(&entity) {
                // Released, stored and released again: queued twice, swept once.
                if seen.insert(entity) {
                    swept.push(entity);
                }
            }
        }
        GcOutcome {
            completed: self.released.is_empty(),
            swept,
        }
    }

    fn check_cache(&mut self, deadline: Deadline) -> bool {
        if self.cached_bytes <= self.byte_limit {
            return true;
        }
        let mut candidates: Vec<(u64, EntityId)> = self
            .entries
            .iter()
            .filter_map(|(entity, entry)| match entry {
                Entry::Live {
                    data: Some(_),
                    touched,
                    ..
                } => Some((*touched, *entity)),
                _ => None,
            })
            .collect();
        candidates.sort_unstable();

        for (_, entity) in candidates {
            if self.cached_bytes <= self.byte_limit || deadline.is_expired() {
                break;
            }
            if let Some(Entry::Live { data, .. }) = self.entries.get_mut(&entity) {
                let evicted = data.take();
                self.drop_data(evicted);
            }
        }
        self.cached_bytes <= self.byte_limit
    }

    fn entity_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::Live { released: false, .. }))
            .count()
    }

    fn cached_bytes(&self) -> u64 {
        self.cached_bytes
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.released.clear();
        self.cached_bytes = 0;
    }
}
