//! Weak references.
//!
//! A weak reference is an ordinary heap object whose referent field is not
//! traced during collection. All registered nodes sit on one intrusive list;
//! after marking, the list is scanned once to drop dead nodes and clear
//! referents that did not survive.

use crate::mark::{MarkHandler, MarkReason, Marker};
use crate::object::{is_object_live, MarkWord, ObjectHeader, ObjectRef};
use crate::types::HeapObject;

/// A weak reference node.
#[repr(C)]
#[derive(Debug)]
pub struct WeakReference {
    pub header: ObjectHeader,
    referent: ObjectRef,
    next: ObjectRef,
}

impl WeakReference {
    /// The referent, or null once it has been collected.
    #[must_use]
    pub const fn get(&self) -> ObjectRef {
        self.referent
    }

    /// Points the reference at a new referent. Takes effect for the next
    /// collection.
    pub fn set(&mut self, referent: ObjectRef) {
        self.referent = referent;
    }
}

unsafe impl HeapObject for WeakReference {
    const NAME: &'static str = "WeakReference";

    fn live(&mut self, _marker: &mut Marker<'_>) {}

    fn live_general(&mut self, handler: &mut dyn MarkHandler) {
        match handler.reason() {
            MarkReason::Collecting => {}
            MarkReason::PreparingImage => handler.mark(&mut self.referent),
            reason => {
                debug_assert!(reason.is_image_transfer());
                handler.mark(&mut self.referent);
                self.next = ObjectRef::NULL;
            }
        }
    }
}

/// What a scan removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WeakScan {
    /// Referents cleared because they died.
    pub cleared: usize,
    /// Nodes unlinked because the node itself died.
    pub dropped: usize,
}

/// The intrusive list of registered weak reference nodes.
#[derive(Debug, Default)]
pub struct WeakList {
    head: ObjectRef,
    len: usize,
}

impl WeakList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: ObjectRef::NULL,
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Links `node` at the head of the list without checking for duplicates.
    ///
    /// # Safety
    ///
    /// `node` must be a live weak reference that is not on the list.
    pub(crate) unsafe fn push(&mut self, node: ObjectRef) {
        let weak = unsafe { node.as_mut::<WeakReference>() };
        weak.next = self.head;
        self.head = node;
        self.len += 1;
    }

    /// `true` if `node` is on the list.
    #[must_use]
    pub fn contains(&self, node: ObjectRef) -> bool {
        self.iter().any(|n| n == node)
    }

    /// Iterates over the registered nodes.
    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            if cur.is_null() {
                return None;
            }
            let node = cur;
            // SAFETY: list members are live weak references.
            cur = unsafe { node.as_ref::<WeakReference>() }.next;
            Some(node)
        })
    }

    /// Unlinks dead nodes and clears dead referents.
    ///
    /// Runs after marking and before the sweep, while dead objects are still
    /// readable.
    pub(crate) fn scan(&mut self, mark_word: MarkWord) -> WeakScan {
        let mut result = WeakScan::default();
        let mut prev = ObjectRef::NULL;
        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: list members are weak references, dead or alive, whose
            // storage has not been swept yet.
            let node = unsafe { cur.as_mut::<WeakReference>() };
            let next = node.next;
            if unsafe { is_object_live(cur, mark_word) } {
                if !node.referent.is_null() && !unsafe { is_object_live(node.referent, mark_word) } {
                    node.referent = ObjectRef::NULL;
                    result.cleared += 1;
                }
                prev = cur;
            } else {
                node.next = ObjectRef::NULL;
                node.referent = ObjectRef::NULL;
                if prev.is_null() {
                    self.head = next;
                } else {
                    unsafe { prev.as_mut::<WeakReference>() }.next = next;
                }
                self.len -= 1;
                result.dropped += 1;
            }
            cur = next;
        }
        result
    }

    pub(crate) fn clear(&mut self) {
        self.head = ObjectRef::NULL;
        self.len = 0;
    }
}
