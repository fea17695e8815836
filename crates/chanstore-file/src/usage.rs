use smallvec::SmallVec;

use chanstore_types::UserId;

/// Number of users stored inline before the map spills to the heap.
///
/// A data file typically has two or three users at once (its channel, the
/// backup thread, occasionally an exporter).
pub const INLINE_USERS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Usage {
    user: UserId,
    count: u32,
}

/// Small map from [`UserId`] to a per-user reference count.
///
/// A linear scan over an inline vector. At the expected cardinality this is
/// faster than hashing, and the vector doubles on overflow like any `Vec`.
/// An entry exists iff its count is non-zero.
#[derive(Clone, Debug, Default)]
pub struct UsageMap {
    entries: SmallVec<[Usage; INLINE_USERS]>,
}

impl UsageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one use for `user`. Returns `true` on the user's 0 -> 1 transition.
    pub fn increment(&mut self, user: UserId) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.user == user) {
            entry.count += 1;
            return false;
        }
        self.entries.push(Usage { user, count: 1 });
        true
    }

    /// Remove one use for `user`.
    ///
    /// Returns `Some(true)` on the user's 1 -> 0 transition (the entry is
    /// removed), `Some(false)` if uses remain, and `None` if `user` has no
    /// entry at all.
    pub fn decrement(&mut self, user: UserId) -> Option<bool> {
        let position = self.entries.iter().position(|e| e.user == user)?;
        let entry = &mut self.entries[position];
        entry.count -= 1;
        if entry.count == 0 {
            self.entries.swap_remove(position);
            return Some(true);
        }
        Some(false)
    }

    /// Drop every use of `user` at once. Returns the removed count.
    pub fn remove(&mut self, user: UserId) -> u32 {
        match self.entries.iter().position(|e| e.user == user) {
            Some(position) => self.entries.swap_remove(position).count,
            None => 0,
        }
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.entries.iter().any(|e| e.user == user)
    }

    pub fn count_of(&self, user: UserId) -> u32 {
        self.entries
            .iter()
            .find(|e| e.user == user)
            .map_or(0, |e| e.count)
    }

    /// Number of distinct users.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
