//! The memory manager.
//!
//! [`Memory`] owns every space, table and root set of one heap. All operations
//! take `&mut self`: the heap is single threaded and stop-the-world, and a
//! caller sharing it across threads wraps it in
//! [`SharedMemory`](crate::SharedMemory).

use std::io::Write;
use std::mem::size_of;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::time::Instant;

use crate::config::MemoryConfig;
use crate::error::{ImageError, MemoryError, Result};
use crate::image::{self, ImageWriter, Visited, IMAGE_HEADER_SIZE};
use crate::live_stack::LiveStack;
use crate::mark::{MarkHandler, MarkReason, Marker};
use crate::metrics::{
    GcMetrics, HeapStats, MemoryCounters, MemoryProfile, PhaseTimer, SpaceStats,
};
use crate::object::{
    allocation_size, Behavior, MarkWord, ObjectHeader, ObjectRef, MINIMUM_OBJECT_SIZE, OBJECT_GRAIN,
};
use crate::old_to_new::{Decrement, OldToNewTable};
use crate::roots::{Anchor, RootHandle, RootStack, SaveStack, ANCHOR_COUNT};
use crate::segment::PoolChain;
use crate::segment_set::{SegmentSet, SetKind};
use crate::types::{
    Array, BehaviorObject, HeapObject, TypeInfo, TypeNumber, TypeRegistry, ARRAY_TYPE, DEAD_TYPE,
    RAW_OBJECT_TYPE, WEAK_REFERENCE_TYPE,
};
use crate::uninit::UninitTable;
use crate::weak::{WeakList, WeakReference};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_phase_end, next_gc_id, trace_gc_collection, trace_image, trace_phase, GcPhase,
};

/// Lifecycle of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapState {
    /// Allocating and collecting normally.
    Running,
    /// An image save rewrote the heap in place. Only reads of tables and
    /// statistics remain valid.
    ImageSaved,
}

/// An object heap with a mark-and-sweep collector.
pub struct Memory {
    config: MemoryConfig,
    registry: TypeRegistry,
    state: HeapState,
    pools: PoolChain,
    normal: SegmentSet,
    large: SegmentSet,
    old: SegmentSet,
    mark_word: MarkWord,
    live_stack: LiveStack,
    roots: RootStack,
    save_stack: SaveStack,
    anchors: [ObjectRef; ANCHOR_COUNT],
    old_to_new: OldToNewTable,
    uninit: UninitTable,
    weak: WeakList,
    collecting: bool,
    last_metrics: GcMetrics,
    counters: MemoryCounters,
}

impl Memory {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Creates an empty heap.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration or if the first pool cannot be
    /// reserved.
    pub fn new(config: MemoryConfig, registry: TypeRegistry) -> Result<Self> {
        config.validate()?;
        let mut pools = PoolChain::new(config.pool_size, config.heap_limit);
        pools
            .reserve_pool(config.pool_size)
            .map_err(MemoryError::Reserve)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            segment_size = config.segment_size,
            large_segment_size = config.large_segment_size,
            pool_size = config.pool_size,
            "memory_initialized"
        );

        Ok(Self {
            normal: SegmentSet::new(SetKind::Normal, config.segment_size, config.large_block_threshold),
            large: SegmentSet::new(
                SetKind::Large,
                config.large_segment_size,
                config.large_block_threshold,
            ),
            old: SegmentSet::new(SetKind::Old, config.segment_size, config.large_block_threshold),
            mark_word: MarkWord::INITIAL,
            live_stack: LiveStack::new(config.live_stack_size),
            roots: RootStack::new(),
            save_stack: SaveStack::new(config.save_stack_size),
            anchors: [ObjectRef::NULL; ANCHOR_COUNT],
            old_to_new: OldToNewTable::with_capacity(config.identity_table_size),
            uninit: UninitTable::with_capacity(config.identity_table_size),
            weak: WeakList::new(),
            collecting: false,
            last_metrics: GcMetrics::new(),
            counters: MemoryCounters::default(),
            state: HeapState::Running,
            pools,
            registry,
            config,
        })
    }

    /// Creates a heap, restoring the image at `config.image_path` when
    /// `restoring` is set.
    ///
    /// # Errors
    ///
    /// As for [`Memory::new`], plus any [`ImageError`] from the restore. A
    /// restoring initialization without an image path is a configuration
    /// error.
    pub fn initialize(config: MemoryConfig, registry: TypeRegistry, restoring: bool) -> Result<Self> {
        if !restoring {
            return Self::new(config, registry);
        }
        let Some(path) = config.image_path.clone() else {
            return Err(MemoryError::Config(
                "restoring requires an image_path".to_string(),
            ));
        };
        let bytes = std::fs::read(&path).map_err(|source| ImageError::Io {
            path: path.clone(),
            source,
        })?;
        Self::restore(config, registry, &bytes)
    }

    /// Creates a heap from image file contents.
    ///
    /// # Errors
    ///
    /// Any malformed image is an [`ImageError`]; nothing is partially
    /// restored.
    pub fn restore(config: MemoryConfig, registry: TypeRegistry, bytes: &[u8]) -> Result<Self> {
        let mut memory = Self::new(config, registry)?;
        memory.restore_image(bytes)?;
        Ok(memory)
    }

    fn restore_image(&mut self, bytes: &[u8]) -> Result<()> {
        #[cfg(feature = "tracing")]
        let _span = trace_image("restore");

        let body = image::image_body(bytes, self.config.max_image_size)?;
        let len = body.len();
        if len < MINIMUM_OBJECT_SIZE {
            return Err(ImageError::MissingSaveArray.into());
        }
        if len % OBJECT_GRAIN != 0 {
            return Err(ImageError::corrupt(0, format!("bad image length {len}")).into());
        }
        let mut segment = self
            .pools
            .take_segment(len)
            .ok_or(MemoryError::Exhausted { size: len })?;
        let Some(base) = segment.bump(len) else {
            return Err(MemoryError::Exhausted { size: len });
        };
        // SAFETY: the segment is fresh and at least `len` bytes long.
        unsafe { ptr::copy_nonoverlapping(body.as_ptr(), base as *mut u8, len) };

        let relocated =
            image::relocate(base, len, &self.registry, self.mark_word, MarkReason::RestoringImage)?;

        let save_array = ObjectRef::from_addr(base);
        let header = unsafe { save_array.header() };
        if header.type_number() != ARRAY_TYPE
            || unsafe { save_array.as_ref::<Array>() }.len() < ANCHOR_COUNT
        {
            return Err(ImageError::MissingSaveArray.into());
        }
        let slots = unsafe { Array::slots(save_array) };
        for anchor in Anchor::ALL {
            self.anchors[anchor.index()] = slots[anchor.index()];
        }

        self.old.add_segment(segment);
        for node in relocated.weak_nodes {
            // SAFETY: freshly relocated nodes are not on the list.
            unsafe { self.weak.push(node) };
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(bytes = len, objects = relocated.objects, "image_restored");
        Ok(())
    }

    /// Releases every pool. All object references into this heap dangle
    /// afterwards.
    pub fn shutdown(mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            reserved = self.pools.reserved(),
            pools = self.pools.pool_count(),
            "memory_shutdown"
        );
        self.release_all();
    }

    fn release_all(&mut self) {
        self.normal.clear();
        self.large.clear();
        self.old.clear();
        self.weak.clear();
        self.uninit.clear();
        self.old_to_new.clear();
        self.roots.clear();
        self.save_stack.clear();
        self.anchors = [ObjectRef::NULL; ANCHOR_COUNT];
        self.pools.release();
    }

    /// Whether the heap still accepts work or was consumed by an image save.
    #[must_use]
    pub const fn state(&self) -> HeapState {
        self.state
    }

    /// The configuration the heap was created with.
    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Type numbers and tracing callbacks known to this heap.
    #[must_use]
    pub const fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            HeapState::Running => Ok(()),
            HeapState::ImageSaved => Err(MemoryError::HeapConsumed),
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocates an untyped object of at least `size` bytes, header included.
    ///
    /// # Errors
    ///
    /// [`MemoryError::Exhausted`] once every remedy has failed.
    pub fn allocate(&mut self, size: usize) -> Result<ObjectRef> {
        self.allocate_typed(size, RAW_OBJECT_TYPE)
    }

    /// Allocates an object of at least `size` bytes tagged with a registered
    /// type number. The body is zeroed.
    ///
    /// # Errors
    ///
    /// As for [`Memory::allocate`], plus [`MemoryError::UnregisteredType`].
    pub fn allocate_typed(&mut self, size: usize, type_number: TypeNumber) -> Result<ObjectRef> {
        let info = self.allocatable(type_number)?;
        let (size, has_references) = (size.max(info.min_size), info.has_references);
        self.allocate_object(size, type_number, has_references)
    }

    /// Registry entry for a type callers may allocate. Dead spans are the
    /// allocator's own and never handed out.
    fn allocatable(&self, type_number: TypeNumber) -> Result<&TypeInfo> {
        match self.registry.get(type_number) {
            Some(info) if type_number != DEAD_TYPE => Ok(info),
            _ => Err(MemoryError::UnregisteredType(type_number)),
        }
    }

    /// Allocates `count` objects of `element_size` bytes each and returns an
    /// array holding them.
    ///
    /// # Errors
    ///
    /// As for [`Memory::allocate_typed`].
    pub fn allocate_batch(
        &mut self,
        element_size: usize,
        count: usize,
        type_number: TypeNumber,
    ) -> Result<ObjectRef> {
        self.allocatable(type_number)?;
        let array = self.new_array(count)?;
        self.roots.push_frame();
        self.roots.push(array);
        let result: Result<()> = (0..count).try_for_each(|index| {
            let element = self.allocate_typed(element_size, type_number)?;
            // SAFETY: the array is rooted and `index < count`.
            unsafe { Array::slots(array)[index] = element };
            Ok(())
        });
        self.roots.pop_frame();
        result.map(|()| array)
    }

    /// Allocates and initializes a `T`. The header written by the allocator
    /// replaces `value.header`.
    ///
    /// References held by `value` are not roots while the allocation runs; if
    /// it triggers a collection they must be reachable some other way.
    ///
    /// # Errors
    ///
    /// As for [`Memory::allocate`], plus [`MemoryError::NotRegistered`].
    pub fn new_object<T: HeapObject>(&mut self, value: T) -> Result<ObjectRef> {
        let Some(type_number) = self.registry.number_of::<T>() else {
            return Err(MemoryError::NotRegistered(T::NAME));
        };
        let obj = self.allocate_object(size_of::<T>(), type_number, T::HAS_REFERENCES)?;
        // SAFETY: the storage is at least `size_of::<T>()` bytes and grain
        // aligned. The header is carried over the write.
        unsafe {
            let header = ptr::read(obj.as_ptr());
            ptr::write(obj.cast::<T>(), value);
            ptr::write(obj.as_ptr(), header);
        }
        Ok(obj)
    }

    /// Allocates an array of `len` null slots.
    ///
    /// # Errors
    ///
    /// As for [`Memory::allocate`].
    pub fn new_array(&mut self, len: usize) -> Result<ObjectRef> {
        let size = Array::size_for(len).ok_or(MemoryError::ObjectTooLarge { size: usize::MAX })?;
        let array = self.allocate_object(size, ARRAY_TYPE, true)?;
        unsafe { array.as_mut::<Array>() }.set_len(len);
        Ok(array)
    }

    /// Allocates a heap-resident behavior.
    ///
    /// # Errors
    ///
    /// As for [`Memory::allocate`].
    pub fn new_behavior(&mut self, owning_class: ObjectRef, method_dictionary: ObjectRef) -> Result<ObjectRef> {
        self.new_object(BehaviorObject {
            header: ObjectHeader::EMPTY,
            owning_class,
            method_dictionary,
        })
    }

    /// Allocates an object in old space. Old space is never swept; use this
    /// for bootstrap objects that live as long as the heap.
    ///
    /// # Errors
    ///
    /// As for [`Memory::allocate_typed`]. Old-space allocation never triggers
    /// a collection.
    pub fn allocate_old(&mut self, size: usize, type_number: TypeNumber) -> Result<ObjectRef> {
        self.ensure_running()?;
        let info = self.allocatable(type_number)?;
        let (size, has_references) = (size.max(info.min_size), info.has_references);
        let size = allocation_size(size).ok_or(MemoryError::ObjectTooLarge { size })?;
        let (addr, size) = if let Some(claimed) = self.old.allocate_from_chains(size) {
            claimed
        } else if let Some(addr) = self.old.allocate_bump(size) {
            (addr, size)
        } else {
            let segment = self
                .pools
                .take_segment(size.max(self.config.segment_size))
                .ok_or(MemoryError::Exhausted { size })?;
            self.old.add_segment(segment);
            let addr = self
                .old
                .allocate_bump(size)
                .ok_or(MemoryError::Exhausted { size })?;
            (addr, size)
        };
        let obj = Self::format_object(addr, size, type_number, has_references, self.mark_word);
        unsafe { obj.header_mut() }.set_old_space();
        self.counters.objects_allocated += 1;
        self.counters.bytes_allocated += size;
        Ok(obj)
    }

    fn allocate_object(
        &mut self,
        size: usize,
        type_number: TypeNumber,
        has_references: bool,
    ) -> Result<ObjectRef> {
        self.ensure_running()?;
        let size = allocation_size(size).ok_or(MemoryError::ObjectTooLarge { size })?;
        let (addr, size) = self.allocate_storage(size)?;
        let obj = Self::format_object(addr, size, type_number, has_references, self.mark_word);
        self.counters.objects_allocated += 1;
        self.counters.bytes_allocated += size;
        Ok(obj)
    }

    fn format_object(
        addr: usize,
        size: usize,
        type_number: TypeNumber,
        has_references: bool,
        mark_word: MarkWord,
    ) -> ObjectRef {
        // SAFETY: the allocator handed out `[addr, addr + size)` exclusively.
        unsafe { ptr::write_bytes(addr as *mut u8, 0, size) };
        let obj = ObjectRef::from_addr(addr);
        unsafe { obj.header_mut() }.initialize(type_number, size, has_references, mark_word);
        obj
    }

    /// Finds storage for `size` bytes, collecting once if nothing else works.
    fn allocate_storage(&mut self, size: usize) -> Result<(usize, usize)> {
        if let Some(found) = self.try_allocate(size) {
            return Ok(found);
        }
        if !self.collecting {
            self.counters.allocation_collections += 1;
            self.collect_internal("allocation_failure");
            if let Some(found) = self.try_allocate(size) {
                return Ok(found);
            }
        }
        #[cfg(feature = "tracing")]
        tracing::warn!(size, reserved = self.pools.reserved(), "heap_exhausted");
        Err(MemoryError::Exhausted { size })
    }

    fn try_allocate(&mut self, size: usize) -> Option<(usize, usize)> {
        let Self {
            normal,
            large,
            pools,
            counters,
            config,
            ..
        } = self;
        let is_large = size > config.large_block_threshold;
        let (set, sibling) = if is_large {
            (large, normal)
        } else {
            (normal, large)
        };

        if let Some(found) = set.allocate_from_chains(size) {
            return Some(found);
        }
        if let Some(addr) = set.allocate_bump(size) {
            return Some((addr, size));
        }
        if let Some(segment) = pools.take_segment(size.max(set.segment_size())) {
            set.add_segment(segment);
            if let Some(addr) = set.allocate_bump(size) {
                return Some((addr, size));
            }
        }
        if let Some(segment) = sibling.take_empty_segment(size) {
            #[cfg(feature = "tracing")]
            tracing::debug!(size, segment = segment.size(), "scavenged_segment");
            counters.segments_scavenged += 1;
            set.add_segment(segment);
            if let Some(addr) = set.allocate_bump(size) {
                return Some((addr, size));
            }
        }
        if let Some(found) = sibling.allocate_from_chains(size) {
            #[cfg(feature = "tracing")]
            tracing::debug!(size, "scavenged_dead_block");
            counters.blocks_scavenged += 1;
            return Some(found);
        }
        None
    }

    /// Shrinks an object in place. The freed tail becomes dead space when it
    /// is at least the minimum object size; otherwise the object keeps it.
    /// Arrays are truncated to the slots that still fit.
    ///
    /// # Errors
    ///
    /// [`MemoryError::CannotGrow`] if `new_size` exceeds the current size,
    /// [`MemoryError::CannotShrink`] if it is below the smallest instance of
    /// the object's type.
    pub fn resize_object(&mut self, obj: ObjectRef, new_size: usize) -> Result<()> {
        self.ensure_running()?;
        self.check_object(obj)?;
        let header = unsafe { obj.header_mut() };
        let current = header.size();
        let minimum = self
            .registry
            .get(header.type_number())
            .map_or(size_of::<ObjectHeader>(), |info| info.min_size);
        if new_size < minimum {
            return Err(MemoryError::CannotShrink {
                minimum,
                requested: new_size,
            });
        }
        let new_size =
            allocation_size(new_size).ok_or(MemoryError::ObjectTooLarge { size: new_size })?;
        if new_size > current {
            return Err(MemoryError::CannotGrow {
                current,
                requested: new_size,
            });
        }
        let tail = current - new_size;
        if tail < MINIMUM_OBJECT_SIZE {
            return Ok(());
        }
        header.set_size(new_size);
        if header.type_number() == ARRAY_TYPE {
            let array = unsafe { obj.as_mut::<Array>() };
            let fits = (new_size - size_of::<Array>()) / size_of::<ObjectRef>();
            if array.len() > fits {
                array.set_len(fits);
            }
        }
        self.release_span(obj.addr() + new_size, tail);
        Ok(())
    }

    fn release_span(&mut self, addr: usize, len: usize) {
        let set = if self.normal.segment_containing(addr).is_some() {
            &mut self.normal
        } else if self.large.segment_containing(addr).is_some() {
            &mut self.large
        } else {
            &mut self.old
        };
        set.release_span(addr, len);
    }

    // ========================================================================
    // Object access
    // ========================================================================

    fn check_object(&self, obj: ObjectRef) -> Result<()> {
        if obj.is_null() || !self.pools.contains(obj.addr()) {
            return Err(MemoryError::NotInHeap(obj.addr()));
        }
        Ok(())
    }

    fn expect_type<T: HeapObject>(&self, obj: ObjectRef) {
        assert!(!obj.is_null(), "null reference used as {}", T::NAME);
        let actual = unsafe { obj.header() }.type_number();
        let expected = self.registry.number_of::<T>();
        assert!(
            expected == Some(actual),
            "object {obj:?} has type {} ({}), not {}",
            actual,
            self.registry.get(actual).map_or("unregistered", |info| info.name),
            T::NAME
        );
    }

    fn expect_array(obj: ObjectRef) {
        assert!(!obj.is_null(), "null reference used as Array");
        let actual = unsafe { obj.header() }.type_number();
        assert!(actual == ARRAY_TYPE, "object {obj:?} has type {actual}, not Array");
    }

    /// Borrows `obj` as a `T`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is null or not a `T`.
    #[must_use]
    pub fn get<T: HeapObject>(&self, obj: ObjectRef) -> &T {
        self.expect_type::<T>(obj);
        unsafe { obj.as_ref::<T>() }
    }

    /// Mutably borrows `obj` as a `T`. Reference fields written through this
    /// borrow bypass the old-to-new bookkeeping; use [`Memory::write_field`]
    /// for objects that may live in old space.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is null or not a `T`.
    #[must_use]
    pub fn get_mut<T: HeapObject>(&mut self, obj: ObjectRef) -> &mut T {
        self.expect_type::<T>(obj);
        unsafe { obj.as_mut::<T>() }
    }

    /// Stores `value` into a reference field of `owner`, recording the change
    /// when `owner` is in old space.
    ///
    /// # Panics
    ///
    /// Panics if `owner` is null or not a `T`.
    pub fn write_field<T: HeapObject>(
        &mut self,
        owner: ObjectRef,
        field: impl FnOnce(&mut T) -> &mut ObjectRef,
        value: ObjectRef,
    ) {
        self.expect_type::<T>(owner);
        let slot = field(unsafe { owner.as_mut::<T>() });
        let previous = std::mem::replace(slot, value);
        if unsafe { owner.header() }.is_old_space() {
            self.record_reference_change(previous, value);
        }
    }

    /// Stores `value` through a raw slot of `owner`.
    ///
    /// # Safety
    ///
    /// `slot` must point at a reference field inside `owner`.
    pub unsafe fn write_reference(&mut self, owner: ObjectRef, slot: *mut ObjectRef, value: ObjectRef) {
        let previous = unsafe { ptr::replace(slot, value) };
        if unsafe { owner.header() }.is_old_space() {
            self.record_reference_change(previous, value);
        }
    }

    /// Number of slots in an array.
    ///
    /// # Panics
    ///
    /// Panics if `array` is not an array.
    #[must_use]
    pub fn array_len(&self, array: ObjectRef) -> usize {
        Self::expect_array(array);
        unsafe { array.as_ref::<Array>() }.len()
    }

    /// Reads a slot. `None` when out of range.
    ///
    /// # Panics
    ///
    /// Panics if `array` is not an array.
    #[must_use]
    pub fn array_get(&self, array: ObjectRef, index: usize) -> Option<ObjectRef> {
        Self::expect_array(array);
        unsafe { Array::slots(array) }.get(index).copied()
    }

    /// Writes a slot through the write barrier.
    ///
    /// # Panics
    ///
    /// Panics if `array` is not an array or `index` is out of range.
    pub fn array_put(&mut self, array: ObjectRef, index: usize, value: ObjectRef) {
        Self::expect_array(array);
        let slots = unsafe { Array::slots(array) };
        assert!(
            index < slots.len(),
            "index {index} out of range for array of {}",
            slots.len()
        );
        let slot: *mut ObjectRef = &mut slots[index];
        unsafe { self.write_reference(array, slot, value) };
    }

    /// The payload of a raw object.
    ///
    /// # Panics
    ///
    /// Panics if `obj` was not allocated with [`Memory::allocate`].
    #[must_use]
    pub fn bytes_mut(&mut self, obj: ObjectRef) -> &mut [u8] {
        self.expect_type::<crate::types::RawObject>(obj);
        unsafe { crate::types::RawObject::bytes_mut(obj) }
    }

    /// Type number of `obj`.
    #[must_use]
    pub fn type_of(&self, obj: ObjectRef) -> TypeNumber {
        unsafe { obj.header() }.type_number()
    }

    /// The behavior of `obj`.
    #[must_use]
    pub fn behavior_of(&self, obj: ObjectRef) -> Option<Behavior> {
        unsafe { obj.header() }.behavior()
    }

    /// Installs a heap-resident behavior on `obj`, or restores its primitive
    /// behavior when `behavior` is null.
    ///
    /// # Errors
    ///
    /// [`MemoryError::NotInHeap`] if `obj` is not a heap object.
    pub fn set_behavior(&mut self, obj: ObjectRef, behavior: ObjectRef) -> Result<()> {
        self.check_object(obj)?;
        let header = unsafe { obj.header_mut() };
        let previous = header.behavior_object();
        if behavior.is_null() {
            let type_number = header.type_number();
            header.set_behavior(Behavior::Primitive(type_number));
        } else {
            header.set_behavior(Behavior::Object(behavior));
        }
        if header.is_old_space() {
            self.record_reference_change(previous, behavior);
        }
        Ok(())
    }

    // ========================================================================
    // Old-to-new bookkeeping
    // ========================================================================

    /// Reports that a reference field of an old-space object changed from
    /// `old` to `new`.
    pub fn record_reference_change(&mut self, old: ObjectRef, new: ObjectRef) {
        if !old.is_null() && !unsafe { old.header() }.is_old_space() {
            if self.old_to_new.decrement(old) == Decrement::Missing {
                self.counters.bookkeeping_errors += 1;
                #[cfg(feature = "tracing")]
                tracing::warn!(object = ?old, "old_to_new_missing_entry");
            }
        }
        if !new.is_null() && !unsafe { new.header() }.is_old_space() {
            self.old_to_new.increment(new);
        }
    }

    #[must_use]
    pub const fn old_to_new(&self) -> &OldToNewTable {
        &self.old_to_new
    }

    // ========================================================================
    // Roots
    // ========================================================================

    /// Pushes an explicit root.
    pub fn push_root(&mut self, obj: ObjectRef) -> RootHandle {
        self.roots.push(obj)
    }

    /// Pops the most recent explicit root. `None` when the stack is empty.
    pub fn pop_root(&mut self) -> Option<ObjectRef> {
        self.roots.pop()
    }

    /// The object a root handle currently holds.
    #[must_use]
    pub fn root(&self, handle: RootHandle) -> Option<ObjectRef> {
        self.roots.get(handle)
    }

    /// Replaces the object behind `handle`. Returns `false` if the handle was
    /// popped.
    pub fn set_root(&mut self, handle: RootHandle, obj: ObjectRef) -> bool {
        self.roots.set(handle, obj)
    }

    /// Opens a root frame. Roots pushed after it are dropped by the matching
    /// [`Memory::pop_frame`].
    pub fn push_frame(&mut self) {
        self.roots.push_frame();
    }

    /// Drops every root pushed since the last [`Memory::push_frame`].
    pub fn pop_frame(&mut self) {
        self.roots.pop_frame();
    }

    /// Keeps `obj` alive until the save stack wraps around or is cleared.
    /// The save stack has a fixed depth; older entries are overwritten.
    pub fn hold(&mut self, obj: ObjectRef) {
        self.save_stack.hold(obj);
    }

    /// Stores a well-known object. Anchors are roots and are written to images.
    pub fn set_anchor(&mut self, anchor: Anchor, obj: ObjectRef) {
        self.anchors[anchor.index()] = obj;
    }

    /// The object stored under `anchor`, or null.
    #[must_use]
    pub const fn anchor(&self, anchor: Anchor) -> ObjectRef {
        self.anchors[anchor.index()]
    }

    // ========================================================================
    // Weak references
    // ========================================================================

    /// Allocates a registered weak reference to `referent`.
    ///
    /// # Errors
    ///
    /// As for [`Memory::allocate`].
    pub fn new_weak_reference(&mut self, referent: ObjectRef) -> Result<ObjectRef> {
        self.roots.push_frame();
        self.roots.push(referent);
        let node = self.allocate_typed(size_of::<WeakReference>(), WEAK_REFERENCE_TYPE);
        self.roots.pop_frame();
        let node = node?;
        unsafe {
            node.as_mut::<WeakReference>().set(referent);
            self.weak.push(node);
        }
        Ok(node)
    }

    /// Puts a weak reference node on the weak list.
    ///
    /// Returns `Ok(false)` if it is already registered.
    ///
    /// # Errors
    ///
    /// [`MemoryError::NotInHeap`] for a null or foreign reference.
    ///
    /// # Panics
    ///
    /// Panics if `node` is not a weak reference.
    pub fn register_weak_reference(&mut self, node: ObjectRef) -> Result<bool> {
        self.check_object(node)?;
        self.expect_type::<WeakReference>(node);
        if self.weak.contains(node) {
            return Ok(false);
        }
        unsafe { self.weak.push(node) };
        Ok(true)
    }

    /// Reads a weak reference. Null once the referent has been collected.
    #[must_use]
    pub fn weak_get(&self, node: ObjectRef) -> ObjectRef {
        self.get::<WeakReference>(node).get()
    }

    pub fn weak_set(&mut self, node: ObjectRef, referent: ObjectRef) {
        self.get_mut::<WeakReference>(node).set(referent);
    }

    #[must_use]
    pub const fn weak_references(&self) -> &WeakList {
        &self.weak
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    /// Registers `obj` for finalization. Returns `Ok(false)` if it already is.
    ///
    /// # Errors
    ///
    /// [`MemoryError::NotInHeap`] for a null or foreign reference.
    pub fn register_finalizer(&mut self, obj: ObjectRef) -> Result<bool> {
        self.check_object(obj)?;
        Ok(self.uninit.register(obj))
    }

    /// Removes `obj` from finalization, pending or not.
    pub fn unregister_finalizer(&mut self, obj: ObjectRef) -> bool {
        self.uninit.unregister(obj)
    }

    /// `true` if `obj` was found dead and its finalizer has not run.
    #[must_use]
    pub fn is_finalization_pending(&self, obj: ObjectRef) -> bool {
        self.uninit.is_pending(obj)
    }

    #[must_use]
    pub const fn uninit_table(&self) -> &UninitTable {
        &self.uninit
    }

    /// Runs the finalizers of every pending object and returns how many
    /// entries were processed.
    ///
    /// Each entry leaves the table before its finalizer runs, so a finalizer
    /// that registers its object again makes a fresh registration. A call made
    /// while finalizers are already running does nothing.
    pub fn run_uninits(&mut self) -> usize {
        if !self.uninit.begin_processing() {
            return 0;
        }
        let pending = self.uninit.pending_snapshot();
        let mut processed = 0;
        for obj in pending {
            if !self.uninit.claim(obj) {
                continue;
            }
            processed += 1;
            let type_number = unsafe { obj.header() }.type_number();
            let Some(uninit) = self.registry.get(type_number).and_then(|info| info.uninit) else {
                continue;
            };

            self.roots.push_frame();
            self.roots.push(obj);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| uninit(self, obj)));
            self.roots.pop_frame();
            match outcome {
                Ok(()) => self.counters.finalizers_run += 1,
                Err(_) => {
                    self.counters.finalizer_failures += 1;
                    #[cfg(feature = "tracing")]
                    tracing::warn!(object = ?obj, type_number, "finalizer_panicked");
                }
            }
        }
        self.uninit.end_processing();
        processed
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Runs a full collection.
    ///
    /// # Errors
    ///
    /// [`MemoryError::HeapConsumed`] after an image save.
    pub fn collect(&mut self) -> Result<GcMetrics> {
        self.ensure_running()?;
        self.collect_internal("explicit");
        Ok(self.last_metrics)
    }

    /// Collects and then runs pending finalizers. Returns the number of
    /// finalizer entries processed.
    ///
    /// # Errors
    ///
    /// As for [`Memory::collect`].
    pub fn collect_and_run_finalizers(&mut self, clear_save_stack: bool) -> Result<usize> {
        if clear_save_stack {
            self.save_stack.clear();
        }
        self.collect()?;
        Ok(self.run_uninits())
    }

    fn collect_internal(&mut self, _trigger: &str) {
        if self.collecting {
            self.counters.collections_skipped += 1;
            return;
        }
        self.collecting = true;

        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_collection(_trigger, next_gc_id());

        let start = Instant::now();
        let mut timer = PhaseTimer::new();
        self.mark_word = self.mark_word.toggled();

        timer.start();
        let objects_marked = {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Mark);
            let mut marker = Marker::new(&mut self.live_stack, self.mark_word, MarkReason::Collecting);
            marker.push_sentinel();
            for root in self.roots.iter() {
                marker.mark_object(root);
            }
            for held in self.save_stack.iter() {
                marker.mark_object(held);
            }
            for anchor in self.anchors {
                marker.mark_object(anchor);
            }
            for remembered in self.old_to_new.keys() {
                marker.mark_object(remembered);
            }
            marker.drain(&self.registry, false);
            #[cfg(feature = "tracing")]
            log_phase_end(GcPhase::Mark, marker.marked(), 0);
            marker.marked()
        };
        timer.end_mark();

        timer.start();
        let (weak_scan, uninits_flagged, resurrected) = {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Weak);
            let weak_scan = self.weak.scan(self.mark_word);
            let flagged = self.uninit.flag_dead(self.mark_word);

            let mut marker = Marker::new(&mut self.live_stack, self.mark_word, MarkReason::Collecting);
            marker.push_sentinel();
            for obj in self.uninit.objects() {
                marker.mark_object(obj);
            }
            marker.drain(&self.registry, false);
            #[cfg(feature = "tracing")]
            log_phase_end(GcPhase::Weak, weak_scan.cleared + weak_scan.dropped, 0);
            (weak_scan, flagged, marker.marked())
        };
        timer.end_weak();
        self.live_stack.reset();

        timer.start();
        let stats = {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Sweep);
            let mut stats = self.normal.sweep(self.mark_word);
            stats += self.large.sweep(self.mark_word);
            #[cfg(feature = "tracing")]
            log_phase_end(GcPhase::Sweep, stats.objects_reclaimed, stats.bytes_reclaimed);
            stats
        };
        timer.end_sweep();

        self.counters.collections += 1;
        self.counters.objects_reclaimed += stats.objects_reclaimed;
        self.counters.bytes_reclaimed += stats.bytes_reclaimed;
        self.counters.live_stack_growths = self.live_stack.growths();
        self.last_metrics = GcMetrics {
            duration: start.elapsed(),
            mark_duration: timer.mark,
            weak_duration: timer.weak,
            sweep_duration: timer.sweep,
            objects_marked: objects_marked + resurrected,
            objects_reclaimed: stats.objects_reclaimed,
            objects_surviving: stats.objects_surviving,
            bytes_reclaimed: stats.bytes_reclaimed,
            bytes_surviving: stats.bytes_surviving,
            weak_refs_cleared: weak_scan.cleared,
            weak_nodes_dropped: weak_scan.dropped,
            uninits_flagged,
            total_collections: self.counters.collections,
        };
        self.collecting = false;
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub const fn last_metrics(&self) -> GcMetrics {
        self.last_metrics
    }

    /// Cumulative counters since the heap was created.
    #[must_use]
    pub const fn counters(&self) -> MemoryCounters {
        self.counters
    }

    // ========================================================================
    // Images
    // ========================================================================

    /// Saves every anchor-reachable object as an image file body with its
    /// length prefix.
    ///
    /// The save rewrites the heap in place: afterwards allocation and
    /// collection fail with [`MemoryError::HeapConsumed`].
    ///
    /// # Errors
    ///
    /// [`ImageError::TooLarge`] if the image exceeds `max_image_size`.
    pub fn save_image(&mut self) -> Result<Vec<u8>> {
        self.ensure_running()?;
        #[cfg(feature = "tracing")]
        let _span = trace_image("save");

        let save_array = self.new_array(ANCHOR_COUNT)?;
        {
            let slots = unsafe { Array::slots(save_array) };
            for anchor in Anchor::ALL {
                slots[anchor.index()] = self.anchors[anchor.index()];
            }
        }
        let buffer = image::reserve_buffer(self.config.max_image_size).map_err(MemoryError::Reserve)?;
        self.state = HeapState::ImageSaved;

        self.mark_word = self.mark_word.toggled();
        {
            let mut marker =
                Marker::new(&mut self.live_stack, self.mark_word, MarkReason::PreparingImage);
            marker.push_sentinel();
            marker.mark_object(save_array);
            marker.drain(&self.registry, true);
        }
        self.live_stack.reset();

        let mut writer = ImageWriter::new(
            buffer,
            self.config.max_image_size,
            Visited::Destructive,
            MarkReason::SavingImage,
            &self.registry,
        );
        let mut root = save_array;
        writer.mark(&mut root);
        writer.drain();
        let _objects = writer.objects();
        let (buffer, len) = writer.finish()?;
        debug_assert!(root.is_null());

        let mut out = Vec::with_capacity(IMAGE_HEADER_SIZE + len);
        out.extend_from_slice(&(len as u64).to_le_bytes());
        // SAFETY: the writer filled the first `len` bytes.
        out.extend_from_slice(unsafe { std::slice::from_raw_parts(buffer.ptr(), len) });

        #[cfg(feature = "tracing")]
        tracing::debug!(bytes = len, objects = _objects, "image_saved");
        Ok(out)
    }

    /// Saves the image to `out` and returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// As for [`Memory::save_image`], plus write failures.
    pub fn save_image_to<W: Write>(&mut self, out: &mut W, path_hint: &Path) -> Result<usize> {
        let bytes = self.save_image()?;
        out.write_all(&bytes).map_err(|source| ImageError::Io {
            path: path_hint.to_path_buf(),
            source,
        })?;
        Ok(bytes.len())
    }

    /// Saves the image to a file.
    ///
    /// # Errors
    ///
    /// As for [`Memory::save_image_to`].
    pub fn save_image_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let mut file = std::fs::File::create(path).map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.save_image_to(&mut file, path)
    }

    /// Copies the graph reachable from `root` into a self-contained buffer.
    /// The originals are left untouched.
    ///
    /// The buffer starts with a one-slot carrier array holding `root`, so
    /// that references back to the root never use offset 0.
    ///
    /// # Errors
    ///
    /// [`ImageError::TooLarge`] if the graph exceeds `max_image_size`.
    pub fn flatten(&mut self, root: ObjectRef) -> Result<Vec<u8>> {
        self.ensure_running()?;
        self.check_object(root)?;
        #[cfg(feature = "tracing")]
        let _span = trace_image("flatten");

        self.roots.push_frame();
        self.roots.push(root);
        let carrier = self.new_array(1);
        self.roots.pop_frame();
        let carrier = carrier?;
        unsafe { Array::slots(carrier)[0] = root };

        let buffer = image::reserve_buffer(self.config.max_image_size).map_err(MemoryError::Reserve)?;
        let mut writer = ImageWriter::new(
            buffer,
            self.config.max_image_size,
            Visited::Table(std::collections::HashMap::with_capacity(
                self.config.identity_table_size,
            )),
            MarkReason::Flattening,
            &self.registry,
        );
        let mut field = carrier;
        writer.mark(&mut field);
        writer.drain();
        let (buffer, len) = writer.finish()?;
        Ok(unsafe { std::slice::from_raw_parts(buffer.ptr(), len) }.to_vec())
    }

    /// Copies a flattened graph into new space and returns its root. The
    /// objects are live in the current cycle; the carrier array becomes
    /// garbage.
    ///
    /// # Errors
    ///
    /// Any malformed buffer is an [`ImageError`]; the block is released
    /// again.
    pub fn unflatten(&mut self, bytes: &[u8]) -> Result<ObjectRef> {
        self.ensure_running()?;
        #[cfg(feature = "tracing")]
        let _span = trace_image("unflatten");

        let len = bytes.len();
        if len > self.config.max_image_size {
            return Err(ImageError::TooLarge {
                max: self.config.max_image_size,
            }
            .into());
        }
        let size = allocation_size(len).ok_or(MemoryError::ObjectTooLarge { size: len })?;
        let (addr, block) = self.allocate_storage(size)?;
        // SAFETY: the allocator handed out at least `len` bytes at `addr`.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, len) };

        let relocated = image::relocate(
            addr,
            len,
            &self.registry,
            self.mark_word,
            MarkReason::Unflattening,
        )
        .and_then(|relocated| {
            let carrier = ObjectRef::from_addr(addr);
            if unsafe { carrier.header() }.type_number() != ARRAY_TYPE
                || unsafe { carrier.as_ref::<Array>() }.is_empty()
            {
                return Err(ImageError::corrupt(0, "buffer does not start with a carrier array"));
            }
            Ok(relocated)
        });
        let relocated = match relocated {
            Ok(relocated) => relocated,
            Err(err) => {
                self.release_span(addr, block);
                return Err(err.into());
            }
        };

        let tail = block - len;
        if tail >= MINIMUM_OBJECT_SIZE {
            self.release_span(addr + len, tail);
        } else if tail > 0 {
            let last = unsafe { ObjectRef::from_addr(addr + relocated.last).header_mut() };
            let size = last.size();
            last.set_size(size + tail);
        }
        for node in relocated.weak_nodes {
            unsafe { self.weak.push(node) };
        }
        self.counters.objects_allocated += relocated.objects;
        self.counters.bytes_allocated += block;
        Ok(unsafe { Array::slots(ObjectRef::from_addr(addr)) }[0])
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Checks that every segment is exactly tiled by well-formed objects and
    /// that every weak list member is a weak reference. Returns the number of
    /// objects walked.
    ///
    /// # Errors
    ///
    /// [`MemoryError::Corrupt`] at the first violation.
    pub fn verify_heap(&self) -> Result<usize> {
        let registry = &self.registry;
        let mut objects = 0;
        for set in [&self.normal, &self.large, &self.old] {
            objects += set
                .verify(|n| registry.get(n).is_some())
                .map_err(|err| MemoryError::Corrupt {
                    addr: err.addr,
                    reason: err.reason,
                })?;
        }
        for node in self.weak.iter() {
            if unsafe { node.header() }.type_number() != WEAK_REFERENCE_TYPE {
                return Err(MemoryError::Corrupt {
                    addr: node.addr(),
                    reason: "weak list member is not a weak reference".to_string(),
                });
            }
        }
        Ok(objects)
    }

    /// `true` if `obj` is the start of an allocated object in this heap.
    #[must_use]
    pub fn is_allocated(&self, obj: ObjectRef) -> bool {
        let addr = obj.addr();
        [&self.normal, &self.large, &self.old]
            .into_iter()
            .find_map(|set| set.segment_containing(addr))
            .is_some_and(|segment| {
                // SAFETY: segments are tiled.
                unsafe { segment.objects() }
                    .take_while(|o| o.addr() <= addr)
                    .any(|o| o.addr() == addr && !unsafe { o.header() }.is_dead_object())
            })
    }

    /// Space usage of every set.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        fn space(set: &SegmentSet) -> SpaceStats {
            SpaceStats {
                segments: set.segment_count(),
                capacity: set.capacity(),
                used: set.used_bytes(),
                dead: set.dead_bytes(),
                dead_objects: set.dead_count(),
            }
        }
        HeapStats {
            normal: space(&self.normal),
            large: space(&self.large),
            old: space(&self.old),
            reserved: self.pools.reserved(),
            pools: self.pools.pool_count(),
            old_to_new_entries: self.old_to_new.len(),
            uninit_entries: self.uninit.len(),
            weak_references: self.weak.len(),
        }
    }

    /// Object counts and bytes per type, dead spans excluded.
    #[must_use]
    pub fn memory_profile(&self) -> MemoryProfile {
        let mut profile = MemoryProfile::new();
        for set in [&self.normal, &self.large, &self.old] {
            for segment in set.segments() {
                for obj in unsafe { segment.objects() } {
                    let header = unsafe { obj.header() };
                    if header.is_dead_object() {
                        continue;
                    }
                    let name = self
                        .registry
                        .get(header.type_number())
                        .map_or("unregistered", |info| info.name);
                    let usage = profile.entry(name).or_default();
                    usage.objects += 1;
                    usage.bytes += header.size();
                }
            }
        }
        profile
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("state", &self.state)
            .field("pools", &self.pools)
            .field("mark_word", &self.mark_word)
            .field("roots", &self.roots.len())
            .field("weak_references", &self.weak.len())
            .field("uninit_entries", &self.uninit.len())
            .field("collections", &self.counters.collections)
            .finish_non_exhaustive()
    }
}
