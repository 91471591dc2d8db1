//! The traversal work list.
//!
//! Growth goes through the process allocator, never the managed heap, so a
//! traversal can always make room without re-entering the collector.

use crate::object::ObjectRef;

const MIN_GROWTH: usize = 64;

/// Work list of objects whose fields still need tracing.
#[derive(Debug)]
pub struct LiveStack {
    items: Vec<ObjectRef>,
    initial_capacity: usize,
    growths: usize,
}

impl LiveStack {
    /// Creates a stack with room for `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            initial_capacity: capacity,
            growths: 0,
        }
    }

    /// Makes room for `additional` more entries, doubling the capacity when
    /// it runs out.
    pub fn check_room(&mut self, additional: usize) {
        let needed = self.items.len() + additional;
        let capacity = self.items.capacity();
        if needed <= capacity {
            return;
        }
        let target = needed.max(capacity * 2).max(MIN_GROWTH);
        self.items.reserve_exact(target - self.items.len());
        self.growths += 1;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            from = capacity,
            to = self.items.capacity(),
            "live_stack_grow"
        );
    }

    #[inline]
    pub fn push(&mut self, obj: ObjectRef) {
        self.check_room(1);
        self.items.push(obj);
    }

    /// Pops the top entry. An empty stack pops null, which every traversal
    /// treats as its end.
    #[inline]
    pub fn pop(&mut self) -> ObjectRef {
        self.items.pop().unwrap_or(ObjectRef::NULL)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Times the stack has grown since it was created.
    #[must_use]
    pub const fn growths(&self) -> usize {
        self.growths
    }

    /// Empties the stack and gives back any capacity gained by growth.
    pub fn reset(&mut self) {
        self.items.clear();
        if self.items.capacity() > self.initial_capacity {
            self.items.shrink_to(self.initial_capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_empty_is_null() {
        let mut stack = LiveStack::new(2);
        assert!(stack.pop().is_null());
    }

    #[test]
    fn test_growth_and_reset() {
        let mut stack = LiveStack::new(2);
        for i in 1..=200 {
            stack.push(ObjectRef::from_addr(i * 16));
        }
        assert_eq!(stack.len(), 200);
        assert!(stack.growths() >= 2);
        assert_eq!(stack.pop(), ObjectRef::from_addr(200 * 16));

        stack.reset();
        assert!(stack.is_empty());
        assert!(stack.capacity() < 200);
    }

    #[test]
    fn test_check_room_doubles() {
        let mut stack = LiveStack::new(100);
        for i in 1..=100 {
            stack.push(ObjectRef::from_addr(i * 16));
        }
        stack.check_room(1);
        assert!(stack.capacity() >= 200);
        assert_eq!(stack.growths(), 1);
    }
}
