//! Segment sets: the normal, large and old object spaces.
//!
//! A set owns its segments and the dead chains threading the free spans inside
//! them. The normal set buckets dead objects by exact size in grains; the large
//! set buckets them by power of two. The old set only bump-allocates and is
//! never swept.

use crate::object::{
    DeadObject, MarkWord, ObjectRef, MAXIMUM_OBJECT_SIZE, MINIMUM_OBJECT_SIZE, OBJECT_GRAIN,
};
use crate::segment::Segment;

/// Which space a set backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    Normal,
    Large,
    Old,
}

// ============================================================================
// Dead chains
// ============================================================================

/// Size-bucketed singly linked lists of dead objects.
#[derive(Debug)]
pub(crate) struct DeadChains {
    heads: Vec<ObjectRef>,
    exact: bool,
    count: usize,
    bytes: usize,
}

impl DeadChains {
    /// One bucket per grain up to `threshold`, plus one overflow bucket.
    fn exact(threshold: usize) -> Self {
        Self {
            heads: vec![ObjectRef::NULL; threshold / OBJECT_GRAIN + 2],
            exact: true,
            count: 0,
            bytes: 0,
        }
    }

    /// One bucket per power of two.
    fn log2() -> Self {
        Self {
            heads: vec![ObjectRef::NULL; usize::BITS as usize],
            exact: false,
            count: 0,
            bytes: 0,
        }
    }

    fn bucket_for(&self, size: usize) -> usize {
        if self.exact {
            (size / OBJECT_GRAIN).min(self.heads.len() - 1)
        } else {
            (usize::BITS - 1 - size.leading_zeros()) as usize
        }
    }

    /// A bucket holds objects of a single size.
    fn is_uniform(&self, bucket: usize) -> bool {
        self.exact && bucket < self.heads.len() - 1
    }

    fn insert(&mut self, obj: ObjectRef) {
        // SAFETY: only freshly formatted dead objects are inserted.
        let size = unsafe { obj.header() }.size();
        let bucket = self.bucket_for(size);
        unsafe { DeadObject::set_next(obj, self.heads[bucket]) };
        self.heads[bucket] = obj;
        self.count += 1;
        self.bytes += size;
    }

    /// Unlinks the smallest dead object of at least `size` bytes from
    /// `bucket`.
    fn take_from(&mut self, bucket: usize, size: usize) -> Option<ObjectRef> {
        let head = self.heads[bucket];
        if head.is_null() {
            return None;
        }
        if self.is_uniform(bucket) {
            // SAFETY: chain entries are dead objects.
            self.heads[bucket] = unsafe { DeadObject::next(head) };
            return Some(self.unlinked(head));
        }

        let mut best = ObjectRef::NULL;
        let mut best_prev = ObjectRef::NULL;
        let mut best_size = usize::MAX;
        let mut prev = ObjectRef::NULL;
        let mut cur = head;
        while !cur.is_null() {
            let cur_size = unsafe { cur.header() }.size();
            if cur_size >= size && cur_size < best_size {
                best = cur;
                best_prev = prev;
                best_size = cur_size;
                if cur_size == size {
                    break;
                }
            }
            prev = cur;
            cur = unsafe { DeadObject::next(cur) };
        }
        if best.is_null() {
            return None;
        }
        let next = unsafe { DeadObject::next(best) };
        if best_prev.is_null() {
            self.heads[bucket] = next;
        } else {
            unsafe { DeadObject::set_next(best_prev, next) };
        }
        Some(self.unlinked(best))
    }

    fn unlinked(&mut self, obj: ObjectRef) -> ObjectRef {
        self.count -= 1;
        self.bytes -= unsafe { obj.header() }.size();
        obj
    }

    /// Best-fit search starting at the bucket for `size`.
    fn take(&mut self, size: usize) -> Option<ObjectRef> {
        let first = self.bucket_for(size);
        (first..self.heads.len()).find_map(|bucket| self.take_from(bucket, size))
    }

    fn clear(&mut self) {
        self.heads.fill(ObjectRef::NULL);
        self.count = 0;
        self.bytes = 0;
    }
}

// ============================================================================
// Sweep statistics
// ============================================================================

/// Totals from sweeping one or more sets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub objects_reclaimed: usize,
    pub bytes_reclaimed: usize,
    pub objects_surviving: usize,
    pub bytes_surviving: usize,
    pub empty_segments: usize,
}

impl std::ops::AddAssign for SweepStats {
    fn add_assign(&mut self, rhs: Self) {
        self.objects_reclaimed += rhs.objects_reclaimed;
        self.bytes_reclaimed += rhs.bytes_reclaimed;
        self.objects_surviving += rhs.objects_surviving;
        self.bytes_surviving += rhs.bytes_surviving;
        self.empty_segments += rhs.empty_segments;
    }
}

/// A tiling violation found by [`SegmentSet::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingError {
    pub addr: usize,
    pub reason: String,
}

// ============================================================================
// SegmentSet
// ============================================================================

/// The segments of one space plus their dead chains.
#[derive(Debug)]
pub struct SegmentSet {
    kind: SetKind,
    segments: Vec<Segment>,
    chains: DeadChains,
    segment_size: usize,
}

impl SegmentSet {
    pub(crate) fn new(kind: SetKind, segment_size: usize, large_block_threshold: usize) -> Self {
        let chains = match kind {
            SetKind::Normal => DeadChains::exact(large_block_threshold),
            SetKind::Large | SetKind::Old => DeadChains::log2(),
        };
        Self {
            kind,
            segments: Vec::new(),
            chains,
            segment_size,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SetKind {
        self.kind
    }

    /// Default size of a segment requested for this set.
    #[must_use]
    pub const fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Dead objects currently on the chains.
    #[must_use]
    pub const fn dead_count(&self) -> usize {
        self.chains.count
    }

    /// Bytes held by dead objects on the chains.
    #[must_use]
    pub const fn dead_bytes(&self) -> usize {
        self.chains.bytes
    }

    /// Bytes below the bump pointers of every segment.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.segments.iter().map(Segment::used).sum()
    }

    /// Bytes owned by the set's segments.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.segments.iter().map(Segment::size).sum()
    }

    pub(crate) fn add_segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// Takes a dead object of at least `size` bytes off the chains.
    ///
    /// Returns the address and the size actually claimed: a remainder smaller
    /// than the minimum object size is absorbed, a larger one goes back on the
    /// chains.
    pub(crate) fn allocate_from_chains(&mut self, size: usize) -> Option<(usize, usize)> {
        let dead = self.chains.take(size)?;
        let addr = dead.addr();
        let dead_size = unsafe { dead.header() }.size();
        let remainder = dead_size - size;
        if remainder >= MINIMUM_OBJECT_SIZE {
            // SAFETY: the remainder is inside the dead span just unlinked.
            let rest = unsafe { DeadObject::format(addr + size, remainder) };
            file_dead(self.kind, &mut self.chains, rest);
            Some((addr, size))
        } else {
            Some((addr, dead_size))
        }
    }

    /// Bumps `size` bytes from the first segment with room.
    pub(crate) fn allocate_bump(&mut self, size: usize) -> Option<usize> {
        self.segments
            .iter_mut()
            .rev()
            .find_map(|segment| segment.bump(size))
    }

    /// Removes an untouched segment of at least `min_size` bytes so it can be
    /// handed to the sibling set.
    pub(crate) fn take_empty_segment(&mut self, min_size: usize) -> Option<Segment> {
        let index = self
            .segments
            .iter()
            .position(|segment| segment.is_empty() && segment.size() >= min_size)?;
        Some(self.segments.swap_remove(index))
    }

    /// Returns the segment containing `addr` below its bump pointer.
    pub(crate) fn segment_containing(&self, addr: usize) -> Option<&Segment> {
        self.segments.iter().find(|segment| segment.contains(addr))
    }

    /// Formats `[addr, addr + len)` as dead objects on the chains. Used when
    /// shrinking an object in place.
    pub(crate) fn release_span(&mut self, addr: usize, len: usize) {
        let (kind, chains) = (self.kind, &mut self.chains);
        unsafe { DeadObject::format_span(addr, len, |dead| file_dead(kind, chains, dead)) };
    }

    /// Rebuilds the dead chains from the current mark state.
    ///
    /// Objects unmarked under `mark_word` die. Adjacent dead spans coalesce; a
    /// dead run reaching a segment's bump pointer lowers it instead.
    ///
    /// # Panics
    ///
    /// Panics on a header whose size cannot be valid, since that means the
    /// heap is corrupt.
    pub(crate) fn sweep(&mut self, mark_word: MarkWord) -> SweepStats {
        debug_assert_ne!(self.kind, SetKind::Old, "old space is never swept");
        let mut stats = SweepStats::default();
        self.chains.clear();

        for segment in &mut self.segments {
            let mut run_start: Option<usize> = None;
            // SAFETY: sweeping keeps each segment tiled.
            for obj in unsafe { segment.objects() } {
                let header = unsafe { obj.header() };
                let size = header.size();
                if header.is_dead_object() {
                    run_start.get_or_insert(obj.addr());
                } else if header.is_live(mark_word) || header.is_old_space() {
                    stats.objects_surviving += 1;
                    stats.bytes_surviving += size;
                    if let Some(start) = run_start.take() {
                        let chains = &mut self.chains;
                        unsafe {
                            DeadObject::format_span(start, obj.addr() - start, |dead| {
                                chains.insert(dead);
                            });
                        }
                    }
                } else {
                    stats.objects_reclaimed += 1;
                    stats.bytes_reclaimed += size;
                    run_start.get_or_insert(obj.addr());
                }
            }
            if let Some(start) = run_start {
                segment.retreat_to(start);
            }
            if segment.is_empty() {
                stats.empty_segments += 1;
            }
        }
        stats
    }

    /// Checks that every segment is exactly tiled by well-formed objects.
    ///
    /// `valid_type` decides whether a type number is known. Returns the number
    /// of objects walked.
    pub(crate) fn verify(&self, valid_type: impl Fn(u16) -> bool) -> Result<usize, TilingError> {
        let mut objects = 0;
        for segment in &self.segments {
            let mut addr = segment.start();
            let end = segment.alloc_ptr();
            while addr < end {
                let header = unsafe { ObjectRef::from_addr(addr).header() };
                let size = header.size();
                if size < MINIMUM_OBJECT_SIZE || size > MAXIMUM_OBJECT_SIZE || size % OBJECT_GRAIN != 0 {
                    return Err(TilingError {
                        addr,
                        reason: format!("bad size {size}"),
                    });
                }
                if !valid_type(header.type_number()) {
                    return Err(TilingError {
                        addr,
                        reason: format!("unknown type number {}", header.type_number()),
                    });
                }
                if self.kind == SetKind::Old && !header.is_old_space() {
                    return Err(TilingError {
                        addr,
                        reason: "old space object without old space flag".to_string(),
                    });
                }
                addr += size;
                objects += 1;
            }
            if addr != end {
                return Err(TilingError {
                    addr,
                    reason: format!("last object overruns the allocation pointer {end:#x}"),
                });
            }
        }
        Ok(objects)
    }

    /// Drops every segment. The storage belongs to the pool chain.
    pub(crate) fn clear(&mut self) {
        self.segments.clear();
        self.chains.clear();
    }
}

/// Links a freshly formatted dead object. Everything tiling an old segment
/// carries the old space flag, free spans included.
fn file_dead(kind: SetKind, chains: &mut DeadChains, dead: ObjectRef) {
    if kind == SetKind::Old {
        // SAFETY: `dead` was just formatted by the caller.
        unsafe { dead.header_mut() }.set_old_space();
    }
    chains.insert(dead);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::PoolChain;
    use crate::types::RAW_OBJECT_TYPE;

    fn normal_set(chain: &mut PoolChain) -> SegmentSet {
        let mut set = SegmentSet::new(SetKind::Normal, 64 * 1024, 4096);
        set.add_segment(chain.take_segment(64 * 1024).unwrap());
        set
    }

    fn alloc(set: &mut SegmentSet, size: usize, epoch: MarkWord) -> ObjectRef {
        let (addr, size) = set
            .allocate_from_chains(size)
            .or_else(|| set.allocate_bump(size).map(|addr| (addr, size)))
            .unwrap();
        let obj = ObjectRef::from_addr(addr);
        unsafe { obj.header_mut() }.initialize(RAW_OBJECT_TYPE, size, false, epoch);
        obj
    }

    #[test]
    fn test_sweep_reclaims_and_coalesces() {
        let mut chain = PoolChain::new(256 * 1024, usize::MAX);
        let mut set = normal_set(&mut chain);
        let epoch = MarkWord::INITIAL;
        let a = alloc(&mut set, 32, epoch);
        let b = alloc(&mut set, 48, epoch);
        let c = alloc(&mut set, 64, epoch);
        let d = alloc(&mut set, 32, epoch);

        let next = epoch.toggled();
        unsafe {
            a.header_mut().set_live(next);
            d.header_mut().set_live(next);
        }
        let stats = set.sweep(next);
        assert_eq!(stats.objects_reclaimed, 2);
        assert_eq!(stats.bytes_reclaimed, 112);
        assert_eq!(stats.objects_surviving, 2);
        assert_eq!(set.dead_count(), 1);
        assert_eq!(set.dead_bytes(), 112);
        assert_eq!(unsafe { b.header() }.size(), 112);
        assert!(unsafe { b.header() }.is_dead_object());
        assert!(c.addr() > b.addr());

        let (addr, size) = set.allocate_from_chains(112).unwrap();
        assert_eq!(addr, b.addr());
        assert_eq!(size, 112);
        assert_eq!(set.verify(|_| true), Ok(3));
    }

    #[test]
    fn test_dead_tail_lowers_bump_pointer() {
        let mut chain = PoolChain::new(256 * 1024, usize::MAX);
        let mut set = normal_set(&mut chain);
        let epoch = MarkWord::INITIAL;
        let a = alloc(&mut set, 32, epoch);
        alloc(&mut set, 32, epoch);

        let next = epoch.toggled();
        unsafe { a.header_mut().set_live(next) };
        set.sweep(next);
        assert_eq!(set.used_bytes(), 32);
        assert_eq!(set.dead_count(), 0);

        let stats = set.sweep(next.toggled());
        assert_eq!(stats.objects_reclaimed, 1);
        assert_eq!(stats.empty_segments, 1);
        assert!(set.take_empty_segment(1).is_some());
        assert_eq!(set.segment_count(), 0);
    }

    #[test]
    fn test_split_keeps_large_remainder() {
        let mut chain = PoolChain::new(256 * 1024, usize::MAX);
        let mut set = normal_set(&mut chain);
        let epoch = MarkWord::INITIAL;
        let a = alloc(&mut set, 256, epoch);
        let keep = alloc(&mut set, 32, epoch);

        let next = epoch.toggled();
        unsafe { keep.header_mut().set_live(next) };
        set.sweep(next);

        let (addr, size) = set.allocate_from_chains(64).unwrap();
        assert_eq!((addr, size), (a.addr(), 64));
        assert_eq!(set.dead_bytes(), 192);

        let (_, absorbed) = set.allocate_from_chains(176).unwrap();
        assert_eq!(absorbed, 192);
        assert_eq!(set.dead_count(), 0);
    }

    #[test]
    fn test_old_set_dead_spans_keep_old_flag() {
        let mut chain = PoolChain::new(256 * 1024, usize::MAX);
        let mut set = SegmentSet::new(SetKind::Old, 64 * 1024, 4096);
        set.add_segment(chain.take_segment(64 * 1024).unwrap());
        let obj = alloc(&mut set, 256, MarkWord::INITIAL);
        unsafe {
            let header = obj.header_mut();
            header.set_old_space();
            header.set_size(64);
        }
        set.release_span(obj.addr() + 64, 192);
        assert_eq!(set.verify(|_| true), Ok(2));

        let (addr, size) = set.allocate_from_chains(64).unwrap();
        assert_eq!((addr, size), (obj.addr() + 64, 64));
        let rest = ObjectRef::from_addr(addr + 64);
        assert!(unsafe { rest.header() }.is_dead_object());
        assert!(unsafe { rest.header() }.is_old_space());
    }

    #[test]
    fn test_log2_chains_best_fit() {
        let mut chains = DeadChains::log2();
        let mut storage = vec![0u128; 256];
        let base = storage.as_mut_ptr() as usize;
        unsafe {
            chains.insert(DeadObject::format(base, 1024 + 512));
            chains.insert(DeadObject::format(base + 2048, 1024 + 64));
        }
        let best = chains.take(1024).unwrap();
        assert_eq!(best.addr(), base + 2048);
        assert_eq!(chains.count, 1);
        assert!(chains.take(4096).is_none());
    }
}
