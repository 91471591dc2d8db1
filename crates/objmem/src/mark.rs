//! Mark handlers and the work-list traversal.
//!
//! A traversal runs with exactly one handler. Objects hand their reference
//! fields to it through `live` (ordinary collection, always a [`Marker`]) or
//! `live_general` (any [`MarkHandler`]). The handler sees the field itself and
//! writes the final value back, which is how image save and restore rewrite
//! references in place.

use crate::live_stack::LiveStack;
use crate::object::{MarkWord, ObjectRef};
use crate::types::TypeRegistry;

/// Why a traversal is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkReason {
    /// Ordinary liveness marking.
    Collecting,
    /// Pass over the anchors before an image save.
    PreparingImage,
    /// Copying the heap into an image buffer.
    SavingImage,
    /// Relocating a loaded image.
    RestoringImage,
    /// Copying a subgraph into a flatten buffer.
    Flattening,
    /// Relocating a flattened subgraph into new space.
    Unflattening,
}

impl MarkReason {
    /// `true` while a graph is being written to or read from a buffer. Weak
    /// references hold their referents strongly in these passes.
    #[must_use]
    pub const fn is_image_transfer(self) -> bool {
        matches!(
            self,
            Self::SavingImage | Self::RestoringImage | Self::Flattening | Self::Unflattening
        )
    }
}

/// The single-method strategy every traversal is parameterized by.
pub trait MarkHandler {
    /// The pass this handler performs.
    fn reason(&self) -> MarkReason;

    /// Visits one reference field. The handler may rewrite the field.
    fn mark(&mut self, field: &mut ObjectRef);
}

// ============================================================================
// Marker
// ============================================================================

/// The liveness marker used by ordinary collections and the image prepare
/// pass.
pub struct Marker<'a> {
    stack: &'a mut LiveStack,
    mark_word: MarkWord,
    reason: MarkReason,
    marked: usize,
}

impl<'a> Marker<'a> {
    pub(crate) fn new(stack: &'a mut LiveStack, mark_word: MarkWord, reason: MarkReason) -> Self {
        Self {
            stack,
            mark_word,
            reason,
            marked: 0,
        }
    }

    /// Marks `obj` live. Null, already-marked and (when collecting) old-space
    /// objects are ignored. Objects that hold references are queued; for the
    /// rest only a heap-resident behavior is marked.
    #[inline]
    pub fn mark_object(&mut self, obj: ObjectRef) {
        if obj.is_null() {
            return;
        }
        // SAFETY: every non-null reference reachable from the roots points at a
        // heap object.
        let header = unsafe { obj.header_mut() };
        if self.reason == MarkReason::Collecting && header.is_old_space() {
            return;
        }
        if header.is_live(self.mark_word) {
            return;
        }
        header.set_live(self.mark_word);
        self.marked += 1;

        if header.has_references() {
            self.stack.push(obj);
        } else {
            let behavior = header.behavior_object();
            self.mark_object(behavior);
        }
    }

    /// Objects marked by this marker so far.
    #[must_use]
    pub const fn marked(&self) -> usize {
        self.marked
    }

    /// The pass this marker performs.
    #[must_use]
    pub const fn reason(&self) -> MarkReason {
        self.reason
    }

    /// Pushes the end-of-traversal sentinel.
    pub(crate) fn push_sentinel(&mut self) {
        self.stack.push(ObjectRef::NULL);
    }

    /// Pops and traces queued objects until the sentinel is reached.
    ///
    /// With `general` set the objects' `live_general` callbacks run instead of
    /// `live`.
    pub(crate) fn drain(&mut self, registry: &TypeRegistry, general: bool) {
        loop {
            let obj = self.stack.pop();
            if obj.is_null() {
                break;
            }
            // SAFETY: only marked heap objects are pushed.
            let header = unsafe { obj.header() };
            let behavior = header.behavior_object();
            self.mark_object(behavior);

            let type_number = header.type_number();
            let Some(info) = registry.get(type_number) else {
                panic!("object {obj:?} has unregistered type number {type_number}");
            };
            // SAFETY: the registry entry was installed for this type number.
            unsafe {
                if general {
                    (info.live_general)(obj, self);
                } else {
                    (info.live)(obj, self);
                }
            }
        }
    }
}

impl MarkHandler for Marker<'_> {
    fn reason(&self) -> MarkReason {
        self.reason
    }

    #[inline]
    fn mark(&mut self, field: &mut ObjectRef) {
        self.mark_object(*field);
    }
}
