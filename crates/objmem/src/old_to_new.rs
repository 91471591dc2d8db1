//! Reference counts for new-space objects referenced from old space.
//!
//! Old space is never traced during a collection, so every new-space object an
//! old-space object points at is kept alive through this table instead. The
//! object model reports each pointer store through
//! [`Memory::record_reference_change`](crate::Memory::record_reference_change).

use std::collections::HashMap;

use crate::object::ObjectRef;

/// Rounds `requested` up to the next `2^k - 1`, with a minimum of 1.
///
/// Identity tables are pre-sized with this.
#[must_use]
pub const fn calculate_bucket_size(requested: usize) -> usize {
    let mut size = requested;
    size |= size >> 1;
    size |= size >> 2;
    size |= size >> 4;
    size |= size >> 8;
    size |= size >> 16;
    #[cfg(target_pointer_width = "64")]
    {
        size |= size >> 32;
    }
    if size == 0 {
        1
    } else {
        size
    }
}

/// Outcome of a decrement, reported so callers can count bookkeeping errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decrement {
    /// The count went down and the entry remains.
    Decremented,
    /// The count reached zero and the entry was dropped.
    Removed,
    /// No entry existed for the object.
    Missing,
}

/// New-space object to number of old-space references to it.
#[derive(Debug, Default)]
pub struct OldToNewTable {
    counts: HashMap<ObjectRef, usize>,
}

impl OldToNewTable {
    /// Creates a table pre-sized for `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            counts: HashMap::with_capacity(calculate_bucket_size(capacity)),
        }
    }

    /// Adds one old-space reference to `obj`.
    pub fn increment(&mut self, obj: ObjectRef) {
        *self.counts.entry(obj).or_insert(0) += 1;
    }

    /// Drops one old-space reference to `obj`.
    pub fn decrement(&mut self, obj: ObjectRef) -> Decrement {
        match self.counts.get_mut(&obj) {
            None => Decrement::Missing,
            Some(count) if *count <= 1 => {
                self.counts.remove(&obj);
                Decrement::Removed
            }
            Some(count) => {
                *count -= 1;
                Decrement::Decremented
            }
        }
    }

    /// Current count for `obj`, 0 if absent.
    #[must_use]
    pub fn count(&self, obj: ObjectRef) -> usize {
        self.counts.get(&obj).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.counts.contains_key(&obj)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Every object with a standing old-space reference. These are roots.
    pub fn keys(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.counts.keys().copied()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}
