//! Segments and the pools they are carved from.
//!
//! A pool is one OS reservation. Segments are contiguous slices of a pool and
//! are bump-allocated from their start. Objects never cross a segment
//! boundary, so walking a segment from its start to its allocation pointer
//! visits every object in it.

use std::io;

use sys_alloc::{Region, RegionOptions};

use crate::object::{ObjectRef, OBJECT_GRAIN};

// ============================================================================
// Segment
// ============================================================================

/// A contiguous run of object storage.
#[derive(Debug)]
pub struct Segment {
    start: usize,
    size: usize,
    alloc_offset: usize,
    pool: usize,
}

impl Segment {
    pub(crate) const fn new(start: usize, size: usize, pool: usize) -> Self {
        Self {
            start,
            size,
            alloc_offset: 0,
            pool,
        }
    }

    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.size
    }

    /// Address of the bump pointer. Everything below it is tiled by objects.
    #[must_use]
    pub const fn alloc_ptr(&self) -> usize {
        self.start + self.alloc_offset
    }

    /// Bytes already handed out or formatted as dead objects.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.alloc_offset
    }

    /// Bytes left for bump allocation.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.size - self.alloc_offset
    }

    /// Index of the owning pool in its chain.
    #[must_use]
    pub const fn pool(&self) -> usize {
        self.pool
    }

    /// `true` if nothing has been allocated from this segment.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.alloc_offset == 0
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.alloc_ptr()
    }

    /// Bumps `size` bytes off the free tail.
    pub(crate) fn bump(&mut self, size: usize) -> Option<usize> {
        debug_assert_eq!(size % OBJECT_GRAIN, 0);
        if size > self.remaining() {
            return None;
        }
        let addr = self.alloc_ptr();
        self.alloc_offset += size;
        Some(addr)
    }

    /// Moves the bump pointer back to `addr`. Everything above it becomes
    /// untouched space again.
    pub(crate) fn retreat_to(&mut self, addr: usize) {
        debug_assert!(addr >= self.start && addr <= self.alloc_ptr());
        self.alloc_offset = addr - self.start;
    }

    /// Iterates over the objects below the bump pointer.
    ///
    /// # Safety
    ///
    /// The segment must be tiled: every header below the bump pointer must
    /// carry a non-zero size.
    pub(crate) unsafe fn objects(&self) -> SegmentObjects {
        SegmentObjects {
            next: self.start,
            end: self.alloc_ptr(),
        }
    }
}

/// Iterator over the objects in a segment, dead objects included.
pub(crate) struct SegmentObjects {
    next: usize,
    end: usize,
}

impl Iterator for SegmentObjects {
    type Item = ObjectRef;

    fn next(&mut self) -> Option<ObjectRef> {
        if self.next >= self.end {
            return None;
        }
        let obj = ObjectRef::from_addr(self.next);
        // SAFETY: guaranteed by `Segment::objects`.
        let size = unsafe { obj.header() }.size();
        assert!(
            size != 0 && size % OBJECT_GRAIN == 0,
            "corrupt header at {obj:?}: size {size}"
        );
        self.next += size;
        Some(obj)
    }
}

// ============================================================================
// Pools
// ============================================================================

struct Pool {
    region: Region,
    used: usize,
}

impl Pool {
    fn remaining(&self) -> usize {
        self.region.len() - self.used
    }
}

/// The chain of OS reservations segments are carved from.
pub struct PoolChain {
    pools: Vec<Pool>,
    pool_size: usize,
    heap_limit: usize,
    reserved: usize,
}

impl PoolChain {
    /// Creates an empty chain. Nothing is reserved until the first segment is
    /// requested.
    #[must_use]
    pub const fn new(pool_size: usize, heap_limit: usize) -> Self {
        Self {
            pools: Vec::new(),
            pool_size,
            heap_limit,
            reserved: 0,
        }
    }

    /// Total bytes reserved from the OS.
    #[must_use]
    pub const fn reserved(&self) -> usize {
        self.reserved
    }

    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Reserves a new pool of at least `min_len` bytes.
    ///
    /// Returns `Ok(None)` if the reservation would cross the heap limit.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping fails.
    pub fn reserve_pool(&mut self, min_len: usize) -> io::Result<Option<usize>> {
        let Some(len) = sys_alloc::round_to_granularity(min_len.max(self.pool_size)) else {
            return Ok(None);
        };
        if self.reserved.saturating_add(len) > self.heap_limit {
            #[cfg(feature = "tracing")]
            tracing::debug!(len, reserved = self.reserved, limit = self.heap_limit, "pool_limit");
            return Ok(None);
        }
        let region = RegionOptions::new().len(len).reserve()?;
        self.reserved += region.len();
        #[cfg(feature = "tracing")]
        tracing::debug!(len = region.len(), pools = self.pools.len() + 1, "pool_reserved");
        self.pools.push(Pool { region, used: 0 });
        Ok(Some(self.pools.len() - 1))
    }

    /// Carves a segment of `size` bytes from the first pool with room,
    /// reserving a new pool if none has any.
    ///
    /// Returns `None` when the heap limit is reached or the OS refuses the
    /// reservation.
    pub fn take_segment(&mut self, size: usize) -> Option<Segment> {
        debug_assert_eq!(size % OBJECT_GRAIN, 0);
        let index = match self.pools.iter().position(|pool| pool.remaining() >= size) {
            Some(index) => index,
            None => match self.reserve_pool(size) {
                Ok(Some(index)) => index,
                Ok(None) => return None,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_err, size, "pool_reserve_failed");
                    return None;
                }
            },
        };
        let pool = &mut self.pools[index];
        let start = pool.region.ptr() as usize + pool.used;
        pool.used += size;
        Some(Segment::new(start, size, index))
    }

    /// `true` if `addr` lies in any pool.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.pools.iter().any(|pool| pool.region.contains(addr))
    }

    /// Returns every pool to the OS.
    pub fn release(&mut self) {
        self.pools.clear();
        self.reserved = 0;
    }
}

impl std::fmt::Debug for PoolChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolChain")
            .field("pools", &self.pools.len())
            .field("pool_size", &self.pool_size)
            .field("heap_limit", &self.heap_limit)
            .field("reserved", &self.reserved)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_bump() {
        let mut segment = Segment::new(0x1000, 64, 0);
        assert!(segment.is_empty());
        assert_eq!(segment.bump(32), Some(0x1000));
        assert_eq!(segment.bump(32), Some(0x1020));
        assert_eq!(segment.bump(16), None);
        assert_eq!(segment.remaining(), 0);
        segment.retreat_to(0x1020);
        assert_eq!(segment.used(), 32);
        assert!(segment.contains(0x1000));
        assert!(!segment.contains(0x1020));
    }

    #[test]
    fn test_pool_chain_carves_segments() {
        let mut chain = PoolChain::new(256 * 1024, usize::MAX);
        let a = chain.take_segment(64 * 1024).unwrap();
        let b = chain.take_segment(64 * 1024).unwrap();
        assert_eq!(chain.pool_count(), 1);
        assert_eq!(b.start(), a.end());
        assert!(chain.contains(a.start()));
        assert!(chain.contains(b.end() - 1));

        chain.release();
        assert_eq!(chain.pool_count(), 0);
        assert_eq!(chain.reserved(), 0);
    }

    #[test]
    fn test_pool_chain_respects_limit() {
        let mut chain = PoolChain::new(128 * 1024, 128 * 1024);
        assert!(chain.take_segment(128 * 1024).is_some());
        assert!(chain.take_segment(64 * 1024).is_none());
    }

    #[test]
    fn test_oversized_segment_gets_own_pool() {
        let mut chain = PoolChain::new(64 * 1024, usize::MAX);
        let big = chain.take_segment(1024 * 1024).unwrap();
        assert_eq!(big.size(), 1024 * 1024);
        assert!(chain.reserved() >= 1024 * 1024);
    }
}
