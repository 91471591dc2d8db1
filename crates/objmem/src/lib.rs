//! Object memory for interpreter runtimes.
//!
//! `objmem` manages the heap of a dynamic language interpreter: segmented
//! allocation with per-size dead chains, a stop-the-world mark-and-sweep
//! collector, weak references, finalization, an old space for image-resident
//! objects and relocatable heap images.
//!
//! # Quick Start
//!
//! ```
//! use objmem::{Anchor, Memory, MemoryConfig, TypeRegistry};
//!
//! let mut memory = Memory::new(MemoryConfig::default(), TypeRegistry::new()).unwrap();
//!
//! let array = memory.new_array(2).unwrap();
//! memory.set_anchor(Anchor::Environment, array);
//!
//! let element = memory.allocate(64).unwrap();
//! memory.array_put(array, 0, element);
//! memory.allocate(64).unwrap();
//!
//! let metrics = memory.collect().unwrap();
//! assert_eq!(metrics.objects_reclaimed, 1);
//! assert_eq!(memory.array_get(array, 0), Some(element));
//! ```
//!
//! # Object Layout
//!
//! Every object starts with an [`ObjectHeader`]: its behavior, its size and a
//! flag word holding the mark bit and the type number. Objects are allocated
//! on 16-byte boundaries and are at least 32 bytes long. Types are described
//! to the collector by implementing [`HeapObject`], usually through
//! `#[derive(HeapObject)]`, and registering them in a [`TypeRegistry`].
//!
//! # Images
//!
//! [`Memory::save_image`] writes everything reachable from the anchors as a
//! position-independent buffer, and [`Memory::restore`] maps it back into old
//! space. [`Memory::flatten`] and [`Memory::unflatten`] do the same for a
//! single object graph without disturbing the heap.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod error;
mod image;
mod live_stack;
mod mark;
mod memory;
mod object;
mod old_to_new;
mod roots;
mod segment;
mod segment_set;
mod sync;
mod tracing;
mod types;
mod uninit;
mod weak;

/// Collection metrics and heap statistics.
pub mod metrics;

pub use config::MemoryConfig;
pub use error::{ImageError, MemoryError, Result};
pub use image::IMAGE_HEADER_SIZE;
pub use live_stack::LiveStack;
pub use mark::{MarkHandler, MarkReason, Marker};
pub use memory::{HeapState, Memory};
pub use metrics::{GcMetrics, HeapStats, MemoryCounters, MemoryProfile, SpaceStats, TypeUsage};
pub use object::{
    allocation_size, round_object_boundary, Behavior, ObjectHeader, ObjectRef,
    MAXIMUM_OBJECT_SIZE, MINIMUM_OBJECT_SIZE, OBJECT_GRAIN,
};
pub use old_to_new::{calculate_bucket_size, Decrement, OldToNewTable};
pub use roots::{Anchor, RootHandle, ANCHOR_COUNT};
pub use segment::{PoolChain, Segment};
pub use segment_set::{SetKind, SweepStats};
pub use sync::SharedMemory;
pub use self::tracing::GcId;
pub use types::{
    Array, BehaviorObject, HeapObject, LiveFn, LiveGeneralFn, RawObject, Slots, TypeInfo,
    TypeNumber, TypeRegistry, UninitFn, ARRAY_TYPE, BEHAVIOR_TYPE, DEAD_TYPE, FIRST_USER_TYPE,
    RAW_OBJECT_TYPE, WEAK_REFERENCE_TYPE,
};
pub use uninit::{UninitState, UninitTable};
pub use weak::{WeakList, WeakReference, WeakScan};

// Re-export derive macro when feature is enabled
#[cfg(feature = "derive")]
pub use objmem_derive::HeapObject;

