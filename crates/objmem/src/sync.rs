//! Sharing one heap between threads.
//!
//! A [`Memory`] is single threaded: every operation takes `&mut self` and a
//! collection stops the world by construction. [`SharedMemory`] puts it behind
//! a `parking_lot` mutex so an interpreter with several threads can take turns
//! on the same heap.
//!
//! # Examples
//!
//! ```
//! use objmem::{Memory, MemoryConfig, SharedMemory, TypeRegistry};
//!
//! let memory = Memory::new(MemoryConfig::default(), TypeRegistry::new()).unwrap();
//! let shared = SharedMemory::new(memory);
//!
//! let worker = std::thread::spawn({
//!     let shared = shared.clone();
//!     move || shared.with(|memory| memory.allocate(64).map(|obj| obj.addr()))
//! });
//!
//! let addr = worker.join().unwrap().unwrap();
//! assert_ne!(addr, 0);
//! ```

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::memory::Memory;

/// A heap shared between threads.
///
/// Object references obtained under one lock stay valid after it is released
/// only if they are rooted; another thread may collect in between.
#[derive(Clone)]
pub struct SharedMemory {
    inner: Arc<Mutex<Memory>>,
}

impl SharedMemory {
    #[must_use]
    pub fn new(memory: Memory) -> Self {
        Self {
            inner: Arc::new(Mutex::new(memory)),
        }
    }

    /// Locks the heap, blocking until it is free.
    pub fn lock(&self) -> MutexGuard<'_, Memory> {
        self.inner.lock()
    }

    /// Locks the heap if no other thread holds it.
    #[must_use]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Memory>> {
        self.inner.try_lock()
    }

    /// Runs `f` with the heap locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut Memory) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Unwraps the heap if this is the last handle.
    ///
    /// # Errors
    ///
    /// Returns `self` if other handles are still alive.
    pub fn into_inner(self) -> Result<Memory, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| Self { inner })
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Some(memory) => f.debug_tuple("SharedMemory").field(&*memory).finish(),
            None => f.write_str("SharedMemory(<locked>)"),
        }
    }
}
