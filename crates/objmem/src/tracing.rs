//! Collector tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for collections, image transfers and finalization.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Phases of a collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Mark roots and trace the live graph.
        Mark,
        /// Scan weak references and flag dead finalizable objects.
        Weak,
        /// Rebuild the dead chains.
        Sweep,
    }

    /// Identifier correlating every event of one collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique collection id.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole collection.
    pub fn trace_gc_collection(trigger: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", trigger = trigger, gc_id = gc_id.0).entered()
    }

    /// Span covering one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Span covering an image save, restore, flatten or unflatten.
    pub fn trace_image(operation: &str) -> span::EnteredSpan {
        span!(Level::DEBUG, "image", operation = operation).entered()
    }

    pub fn log_phase_end(phase: GcPhase, objects: usize, bytes: usize) {
        tracing::debug!(phase = ?phase, objects, bytes, "phase_end");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
