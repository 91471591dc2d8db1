//! The finalization ("uninit") table.
//!
//! An entry moves from registered to pending when a collection finds its
//! object dead. Pending objects are kept alive by that same collection so the
//! finalizer can still read them, and are removed from the table just before
//! their finalizer runs.

use std::collections::HashMap;

use crate::object::{is_object_live, MarkWord, ObjectRef};

/// State of a registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninitState {
    /// Alive, or not yet found dead.
    Registered,
    /// Found dead; its finalizer has not run yet.
    Pending,
}

/// Objects with finalizers.
#[derive(Debug, Default)]
pub struct UninitTable {
    entries: HashMap<ObjectRef, UninitState>,
    processing: bool,
}

impl UninitTable {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            processing: false,
        }
    }

    /// Registers `obj`. Returns `false` if it was already registered.
    pub fn register(&mut self, obj: ObjectRef) -> bool {
        if self.entries.contains_key(&obj) {
            return false;
        }
        self.entries.insert(obj, UninitState::Registered);
        true
    }

    /// Removes `obj`, whatever its state. Returns `false` if it was absent.
    pub fn unregister(&mut self, obj: ObjectRef) -> bool {
        self.entries.remove(&obj).is_some()
    }

    #[must_use]
    pub fn state(&self, obj: ObjectRef) -> Option<UninitState> {
        self.entries.get(&obj).copied()
    }

    #[must_use]
    pub fn is_pending(&self, obj: ObjectRef) -> bool {
        self.state(obj) == Some(UninitState::Pending)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|state| **state == UninitState::Pending)
            .count()
    }

    /// Flags every registered entry whose object is unmarked under
    /// `mark_word`. Returns how many were flagged.
    pub(crate) fn flag_dead(&mut self, mark_word: MarkWord) -> usize {
        let mut flagged = 0;
        for (obj, state) in &mut self.entries {
            if *state == UninitState::Registered && !unsafe { is_object_live(*obj, mark_word) } {
                *state = UninitState::Pending;
                flagged += 1;
            }
        }
        flagged
    }

    /// Every tracked object. All of them are roots, so pending objects stay
    /// readable until finalized.
    pub(crate) fn objects(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.entries.keys().copied()
    }

    /// Enters finalization. Returns `false` if finalization is already running.
    pub(crate) fn begin_processing(&mut self) -> bool {
        if self.processing {
            return false;
        }
        self.processing = true;
        true
    }

    pub(crate) fn end_processing(&mut self) {
        self.processing = false;
    }

    #[must_use]
    pub const fn is_processing(&self) -> bool {
        self.processing
    }

    /// The pending objects at this moment.
    pub(crate) fn pending_snapshot(&self) -> Vec<ObjectRef> {
        self.entries
            .iter()
            .filter(|(_, state)| **state == UninitState::Pending)
            .map(|(obj, _)| *obj)
            .collect()
    }

    /// Removes `obj` if it is still pending. Returns `true` if the caller now
    /// owns running its finalizer.
    pub(crate) fn claim(&mut self, obj: ObjectRef) -> bool {
        if self.is_pending(obj) {
            self.entries.remove(&obj);
            true
        } else {
            false
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.processing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice() {
        let obj = ObjectRef::from_addr(0x40);
        let mut table = UninitTable::default();
        assert!(table.register(obj));
        assert!(!table.register(obj));
        assert_eq!(table.state(obj), Some(UninitState::Registered));
        assert!(table.unregister(obj));
        assert!(!table.unregister(obj));
    }

    #[test]
    fn test_processing_guard() {
        let mut table = UninitTable::default();
        assert!(table.begin_processing());
        assert!(!table.begin_processing());
        table.end_processing();
        assert!(!table.is_processing());
    }

    #[test]
    fn test_claim_only_pending() {
        let obj = ObjectRef::from_addr(0x40);
        let mut table = UninitTable::default();
        table.register(obj);
        assert!(!table.claim(obj));
        table.entries.insert(obj, UninitState::Pending);
        assert_eq!(table.pending_snapshot(), vec![obj]);
        assert!(table.claim(obj));
        assert!(table.is_empty());
        assert!(!table.claim(obj));
    }
}
