//! Collection metrics and heap statistics.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Statistics from the most recent collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcMetrics {
    /// Duration of the whole collection.
    pub duration: Duration,
    /// Duration of root marking and tracing.
    pub mark_duration: Duration,
    /// Duration of the weak reference and finalization passes.
    pub weak_duration: Duration,
    /// Duration of the sweep.
    pub sweep_duration: Duration,
    /// Objects marked live.
    pub objects_marked: usize,
    /// Objects reclaimed by the sweep.
    pub objects_reclaimed: usize,
    /// Objects surviving the sweep.
    pub objects_surviving: usize,
    /// Bytes reclaimed by the sweep.
    pub bytes_reclaimed: usize,
    /// Bytes surviving the sweep.
    pub bytes_surviving: usize,
    /// Weak references whose referent was cleared.
    pub weak_refs_cleared: usize,
    /// Weak reference nodes dropped from the list because they died.
    pub weak_nodes_dropped: usize,
    /// Finalizable objects flagged pending.
    pub uninits_flagged: usize,
    /// Collections since the heap was initialized, this one included.
    pub total_collections: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            weak_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            objects_marked: 0,
            objects_reclaimed: 0,
            objects_surviving: 0,
            bytes_reclaimed: 0,
            bytes_surviving: 0,
            weak_refs_cleared: 0,
            weak_nodes_dropped: 0,
            uninits_flagged: 0,
            total_collections: 0,
        }
    }
}

/// Captures phase durations during a collection.
///
/// ```
/// use objmem::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... mark ...
/// timer.end_mark();
/// timer.start();
/// // ... weak references and finalization ...
/// timer.end_weak();
/// timer.start();
/// // ... sweep ...
/// timer.end_sweep();
/// assert!(timer.total() >= timer.mark);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    pub mark: Duration,
    pub weak: Duration,
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            weak: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark = start.elapsed();
        }
    }

    pub fn end_weak(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.weak = start.elapsed();
        }
    }

    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep = start.elapsed();
        }
    }

    /// Sum of the recorded phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.mark + self.weak + self.sweep
    }
}

/// Cumulative counters for one heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    pub collections: usize,
    pub collections_skipped: usize,
    pub objects_allocated: usize,
    pub bytes_allocated: usize,
    pub objects_reclaimed: usize,
    pub bytes_reclaimed: usize,
    /// Empty segments moved between the normal and large sets.
    pub segments_scavenged: usize,
    /// Dead blocks borrowed from the sibling set.
    pub blocks_scavenged: usize,
    /// Collections triggered by a failed allocation.
    pub allocation_collections: usize,
    pub live_stack_growths: usize,
    /// Decrements of absent old-to-new entries.
    pub bookkeeping_errors: usize,
    pub finalizers_run: usize,
    /// Finalizers that panicked.
    pub finalizer_failures: usize,
}

/// Space usage of one segment set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceStats {
    pub segments: usize,
    /// Bytes owned by the segments.
    pub capacity: usize,
    /// Bytes below the bump pointers, live and dead.
    pub used: usize,
    /// Bytes on the dead chains.
    pub dead: usize,
    pub dead_objects: usize,
}

/// Snapshot of the whole heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub normal: SpaceStats,
    pub large: SpaceStats,
    pub old: SpaceStats,
    /// Bytes reserved from the OS.
    pub reserved: usize,
    pub pools: usize,
    pub old_to_new_entries: usize,
    pub uninit_entries: usize,
    pub weak_references: usize,
}

impl HeapStats {
    /// Bytes in use by objects in new space, dead chains excluded.
    #[must_use]
    pub const fn new_space_live_bytes(&self) -> usize {
        self.normal.used - self.normal.dead + self.large.used - self.large.dead
    }
}

/// Object count and bytes for one type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeUsage {
    pub objects: usize,
    pub bytes: usize,
}

/// Per-type usage across the heap, keyed by type name. Dead spans are
/// excluded.
pub type MemoryProfile = BTreeMap<&'static str, TypeUsage>;
