//! Root sets: the explicit root stack, the save stack and the anchors.

use std::collections::VecDeque;

use crate::object::ObjectRef;

// ============================================================================
// RootStack - explicit push/pop roots
// ============================================================================

/// Index of a slot on the [`RootStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(pub(crate) usize);

/// Roots pushed and popped by the interpreter.
#[derive(Debug, Default)]
pub struct RootStack {
    roots: Vec<ObjectRef>,
    frame_markers: Vec<usize>,
}

impl RootStack {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            roots: Vec::new(),
            frame_markers: Vec::new(),
        }
    }

    /// Pushes a root and returns its slot.
    pub fn push(&mut self, obj: ObjectRef) -> RootHandle {
        self.roots.push(obj);
        RootHandle(self.roots.len() - 1)
    }

    /// Pops the most recent root.
    pub fn pop(&mut self) -> Option<ObjectRef> {
        self.roots.pop()
    }

    #[must_use]
    pub fn get(&self, handle: RootHandle) -> Option<ObjectRef> {
        self.roots.get(handle.0).copied()
    }

    /// Overwrites a slot. Returns `false` if the slot was popped.
    pub fn set(&mut self, handle: RootHandle, obj: ObjectRef) -> bool {
        match self.roots.get_mut(handle.0) {
            Some(slot) => {
                *slot = obj;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.roots.iter().copied()
    }

    /// Remembers the current depth.
    pub fn push_frame(&mut self) {
        self.frame_markers.push(self.roots.len());
    }

    /// Drops every root pushed since the matching [`RootStack::push_frame`].
    pub fn pop_frame(&mut self) {
        if let Some(depth) = self.frame_markers.pop() {
            self.roots.truncate(depth);
        }
    }

    pub fn clear(&mut self) {
        self.roots.clear();
        self.frame_markers.clear();
    }
}

// ============================================================================
// SaveStack - recently held objects
// ============================================================================

/// A bounded ring of recently held objects.
///
/// Holding an object keeps it alive until it is pushed out by newer holds or
/// the stack is cleared, which covers temporaries between two allocations.
#[derive(Debug)]
pub struct SaveStack {
    items: VecDeque<ObjectRef>,
    capacity: usize,
}

impl SaveStack {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Holds `obj`, evicting the oldest entry when full.
    pub fn hold(&mut self, obj: ObjectRef) {
        if self.capacity == 0 || obj.is_null() {
            return;
        }
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(obj);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.items.iter().copied()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

// ============================================================================
// Anchors
// ============================================================================

/// Globally anchored objects. They are roots, and they are what an image
/// saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Anchor {
    Environment = 0,
    Nil = 1,
    True = 2,
    False = 3,
    Behaviors = 4,
    Packages = 5,
    CommonStrings = 6,
}

impl Anchor {
    /// Every anchor, in save array order.
    pub const ALL: [Self; ANCHOR_COUNT] = [
        Self::Environment,
        Self::Nil,
        Self::True,
        Self::False,
        Self::Behaviors,
        Self::Packages,
        Self::CommonStrings,
    ];

    /// Slot of this anchor in the save array.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Number of anchors.
pub const ANCHOR_COUNT: usize = 7;
