//! Object layout: references, headers, behavior words and dead objects.
//!
//! Every heap object starts with an [`ObjectHeader`]. All address arithmetic on
//! object storage lives in this module and in `segment`; everything else works
//! with [`ObjectRef`] and the header accessors.

use std::fmt;

use crate::types::{TypeNumber, DEAD_TYPE};

// ============================================================================
// Constants
// ============================================================================

/// Allocation granularity. Every object size is a multiple of this.
pub const OBJECT_GRAIN: usize = 16;

/// Smallest object the allocator hands out, and the smallest dead span it
/// will split off.
pub const MINIMUM_OBJECT_SIZE: usize = 32;

/// Largest size a single header can describe.
pub const MAXIMUM_OBJECT_SIZE: usize = (u32::MAX as usize) & !(OBJECT_GRAIN - 1);

/// Rounds `size` up to the object grain.
#[must_use]
pub const fn round_object_boundary(size: usize) -> usize {
    (size + OBJECT_GRAIN - 1) & !(OBJECT_GRAIN - 1)
}

/// Returns the storage size for a request of `size` bytes, or `None` if it
/// cannot be described by a header.
#[must_use]
pub const fn allocation_size(size: usize) -> Option<usize> {
    if size > MAXIMUM_OBJECT_SIZE {
        return None;
    }
    let size = round_object_boundary(size);
    if size < MINIMUM_OBJECT_SIZE {
        Some(MINIMUM_OBJECT_SIZE)
    } else {
        Some(size)
    }
}

// ============================================================================
// ObjectRef
// ============================================================================

/// A reference to a heap object, or null.
///
/// The word is an address while the object graph is live, and a byte offset
/// into an image or flatten buffer while the graph is being written or read.
/// Offset 0 is the first object in a buffer, which nothing refers back to, so
/// 0 keeps meaning null in both forms.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// The null reference.
    pub const NULL: Self = Self(0);

    /// Returns `true` for the null reference.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Creates a reference from an object pointer.
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline]
    pub(crate) const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub(crate) const fn from_offset(offset: usize) -> Self {
        Self(offset)
    }

    /// The raw address (or buffer offset) held by this reference.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[inline]
    pub(crate) const fn offset(self) -> usize {
        self.0
    }

    /// Pointer to the object's header.
    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *mut ObjectHeader {
        self.0 as *mut ObjectHeader
    }

    /// Pointer to the object cast to its concrete layout.
    #[inline]
    #[must_use]
    pub const fn cast<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Borrows the object's header.
    ///
    /// # Safety
    ///
    /// The reference must be non-null and point at a live heap object, and no
    /// mutable borrow of the header may be active.
    #[inline]
    #[must_use]
    pub unsafe fn header<'a>(self) -> &'a ObjectHeader {
        unsafe { &*self.as_ptr() }
    }

    /// Mutably borrows the object's header.
    ///
    /// # Safety
    ///
    /// As for [`ObjectRef::header`], and the borrow must be unique.
    #[inline]
    #[must_use]
    pub unsafe fn header_mut<'a>(self) -> &'a mut ObjectHeader {
        unsafe { &mut *self.as_ptr() }
    }

    /// Borrows the object as `T`.
    ///
    /// # Safety
    ///
    /// The object must have been allocated with `T`'s layout and no mutable
    /// borrow of it may be active.
    #[inline]
    #[must_use]
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        unsafe { &*self.cast::<T>() }
    }

    /// Mutably borrows the object as `T`.
    ///
    /// # Safety
    ///
    /// As for [`ObjectRef::as_ref`], and the borrow must be unique.
    #[inline]
    #[must_use]
    pub unsafe fn as_mut<'a, T>(self) -> &'a mut T {
        unsafe { &mut *self.cast::<T>() }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("ObjectRef(null)")
        } else {
            write!(f, "ObjectRef({:#x})", self.0)
        }
    }
}

// ============================================================================
// Behavior word
// ============================================================================

const BEHAVIOR_TAG_MASK: usize = 0b11;
const TAG_OBJECT: usize = 0b00;
const TAG_PRIMITIVE: usize = 0b01;
const TAG_SAVE_OFFSET: usize = 0b10;

/// Decoded form of a header's behavior word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// A built-in behavior, identified by the primitive type number.
    Primitive(TypeNumber),
    /// A behavior that is itself a heap object and must be kept alive.
    Object(ObjectRef),
    /// Offset of this object's copy in an image being saved. Only ever seen on
    /// originals during an image save.
    SaveOffset(usize),
}

/// Tagged storage for a [`Behavior`]. Heap objects are grain aligned, so the
/// two low bits are free for the tag.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct BehaviorWord(usize);

impl BehaviorWord {
    /// Encodes a behavior.
    #[must_use]
    pub const fn encode(behavior: Behavior) -> Self {
        match behavior {
            Behavior::Primitive(n) => Self(((n as usize) << 2) | TAG_PRIMITIVE),
            Behavior::Object(obj) => Self(obj.addr() | TAG_OBJECT),
            Behavior::SaveOffset(offset) => Self(offset | TAG_SAVE_OFFSET),
        }
    }

    /// Decodes the word. Returns `None` for a word that no behavior encodes to.
    #[must_use]
    pub const fn decode(self) -> Option<Behavior> {
        match self.0 & BEHAVIOR_TAG_MASK {
            TAG_PRIMITIVE => {
                let n = self.0 >> 2;
                if n > TypeNumber::MAX as usize {
                    None
                } else {
                    #[allow(clippy::cast_possible_truncation)]
                    Some(Behavior::Primitive(n as TypeNumber))
                }
            }
            TAG_OBJECT if self.0 != 0 => Some(Behavior::Object(ObjectRef::from_addr(self.0))),
            TAG_SAVE_OFFSET => Some(Behavior::SaveOffset(self.0 & !BEHAVIOR_TAG_MASK)),
            _ => None,
        }
    }

    /// The raw tagged word.
    #[must_use]
    pub const fn bits(self) -> usize {
        self.0
    }
}

impl fmt::Debug for BehaviorWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Some(b) => write!(f, "{b:?}"),
            None => write!(f, "BehaviorWord(invalid {:#x})", self.0),
        }
    }
}

// ============================================================================
// Mark word
// ============================================================================

const MARK_BIT: u32 = 0x0001;
const OLD_SPACE: u32 = 0x0002;
const HAS_REFERENCES: u32 = 0x0004;
const NON_PRIMITIVE_BEHAVIOR: u32 = 0x0008;
const FLAG_MASK: u32 = 0xFFFF;
const TYPE_SHIFT: u32 = 16;

/// The rolling collection epoch.
///
/// An object is live in the current cycle iff its stored mark bit equals the
/// mark word. Toggling the word at the start of a cycle makes every object
/// unmarked at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkWord(u32);

impl MarkWord {
    /// The epoch a fresh heap starts in.
    pub const INITIAL: Self = Self(0);

    /// Advances to the next epoch.
    #[must_use]
    pub const fn toggled(self) -> Self {
        Self(self.0 ^ MARK_BIT)
    }
}

// ============================================================================
// ObjectHeader
// ============================================================================

/// The fixed header at the start of every heap object.
///
/// Layout: behavior word, object size in bytes, flag word. The upper half of
/// the flag word carries the primitive type number used to dispatch the
/// object's `live` callbacks.
#[repr(C)]
pub struct ObjectHeader {
    behavior: BehaviorWord,
    size: u32,
    flags: u32,
}

impl ObjectHeader {
    /// Placeholder used when building an object value before allocation. The
    /// allocator overwrites it.
    pub const EMPTY: Self = Self {
        behavior: BehaviorWord(0),
        size: 0,
        flags: 0,
    };

    /// Creates an empty header. Same as [`ObjectHeader::EMPTY`].
    #[must_use]
    pub const fn new() -> Self {
        Self::EMPTY
    }

    #[inline]
    pub(crate) fn initialize(
        &mut self,
        type_number: TypeNumber,
        size: usize,
        has_references: bool,
        mark_word: MarkWord,
    ) {
        debug_assert!(size <= MAXIMUM_OBJECT_SIZE && size % OBJECT_GRAIN == 0);
        self.behavior = BehaviorWord::encode(Behavior::Primitive(type_number));
        #[allow(clippy::cast_possible_truncation)]
        {
            self.size = size as u32;
        }
        let mut flags = (u32::from(type_number) << TYPE_SHIFT) | mark_word.0;
        if has_references {
            flags |= HAS_REFERENCES;
        }
        self.flags = flags;
    }

    /// Size of the object in bytes, header included.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size as usize
    }

    #[inline]
    pub(crate) fn set_size(&mut self, size: usize) {
        debug_assert!(size <= MAXIMUM_OBJECT_SIZE && size % OBJECT_GRAIN == 0);
        #[allow(clippy::cast_possible_truncation)]
        {
            self.size = size as u32;
        }
    }

    /// Primitive type number used for dispatch.
    #[inline]
    #[must_use]
    pub const fn type_number(&self) -> TypeNumber {
        #[allow(clippy::cast_possible_truncation)]
        let n = (self.flags >> TYPE_SHIFT) as TypeNumber;
        n
    }

    /// The decoded behavior. `None` only for a corrupted header.
    #[inline]
    #[must_use]
    pub const fn behavior(&self) -> Option<Behavior> {
        self.behavior.decode()
    }

    #[inline]
    pub(crate) const fn behavior_word(&self) -> BehaviorWord {
        self.behavior
    }

    /// Installs a behavior, keeping the non-primitive flag in step with it.
    #[inline]
    pub(crate) fn set_behavior(&mut self, behavior: Behavior) {
        self.behavior = BehaviorWord::encode(behavior);
        match behavior {
            Behavior::Object(_) => self.flags |= NON_PRIMITIVE_BEHAVIOR,
            Behavior::Primitive(_) => self.flags &= !NON_PRIMITIVE_BEHAVIOR,
            Behavior::SaveOffset(_) => {}
        }
    }

    /// Overwrites the raw behavior word without touching any flag. Used while
    /// copying into and out of buffers, where the word holds an offset.
    #[inline]
    pub(crate) fn set_behavior_word(&mut self, word: BehaviorWord) {
        self.behavior = word;
    }

    /// The behavior object as a reference, or null for primitive behaviors.
    #[inline]
    #[must_use]
    pub const fn behavior_object(&self) -> ObjectRef {
        if self.flags & NON_PRIMITIVE_BEHAVIOR != 0 && self.behavior.0 & BEHAVIOR_TAG_MASK == TAG_OBJECT
        {
            ObjectRef::from_addr(self.behavior.0)
        } else {
            ObjectRef::NULL
        }
    }

    /// `true` if the object lives in old space and is never swept.
    #[inline]
    #[must_use]
    pub const fn is_old_space(&self) -> bool {
        self.flags & OLD_SPACE != 0
    }

    #[inline]
    pub(crate) fn set_old_space(&mut self) {
        self.flags |= OLD_SPACE;
    }

    #[inline]
    pub(crate) fn clear_old_space(&mut self) {
        self.flags &= !OLD_SPACE;
    }

    /// `true` if the object may hold references and must be traced.
    #[inline]
    #[must_use]
    pub const fn has_references(&self) -> bool {
        self.flags & HAS_REFERENCES != 0
    }

    /// `true` if the behavior is a heap object.
    #[inline]
    #[must_use]
    pub const fn has_object_behavior(&self) -> bool {
        self.flags & NON_PRIMITIVE_BEHAVIOR != 0
    }

    /// `true` for a free span.
    #[inline]
    #[must_use]
    pub const fn is_dead_object(&self) -> bool {
        self.type_number() == DEAD_TYPE
    }

    #[inline]
    pub(crate) const fn is_live(&self, mark_word: MarkWord) -> bool {
        self.flags & MARK_BIT == mark_word.0
    }

    #[inline]
    pub(crate) fn set_live(&mut self, mark_word: MarkWord) {
        self.flags = (self.flags & !MARK_BIT) | mark_word.0;
    }

    #[inline]
    pub(crate) fn clear_mark(&mut self) {
        self.flags &= !MARK_BIT;
    }

    /// Flag bits without the type number.
    #[inline]
    #[must_use]
    pub const fn flag_bits(&self) -> u32 {
        self.flags & FLAG_MASK
    }
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("behavior", &self.behavior)
            .field("size", &self.size)
            .field("type", &self.type_number())
            .field("flags", &format_args!("{:#06x}", self.flag_bits()))
            .finish()
    }
}

/// `true` if `obj` survives the cycle running under `mark_word`.
///
/// # Safety
///
/// `obj` must be non-null and point at a heap object.
#[inline]
pub(crate) unsafe fn is_object_live(obj: ObjectRef, mark_word: MarkWord) -> bool {
    let header = unsafe { obj.header() };
    header.is_old_space() || header.is_live(mark_word)
}

// ============================================================================
// Dead objects
// ============================================================================

/// A free span, chained into a segment set's dead chains.
#[repr(C)]
pub(crate) struct DeadObject {
    pub(crate) header: ObjectHeader,
    pub(crate) next: ObjectRef,
}

impl DeadObject {
    /// Formats `[addr, addr + size)` as a single dead object and returns it.
    ///
    /// # Safety
    ///
    /// The span must be owned by a segment, grain aligned, and at least
    /// `MINIMUM_OBJECT_SIZE` bytes.
    pub(crate) unsafe fn format(addr: usize, size: usize) -> ObjectRef {
        debug_assert!(size >= MINIMUM_OBJECT_SIZE && size <= MAXIMUM_OBJECT_SIZE);
        debug_assert_eq!(addr % OBJECT_GRAIN, 0);
        let dead = addr as *mut Self;
        unsafe {
            let header = &mut (*dead).header;
            header.initialize(DEAD_TYPE, size, false, MarkWord::INITIAL);
            (*dead).next = ObjectRef::NULL;
        }
        ObjectRef::from_addr(addr)
    }

    /// Formats a span of any length as consecutive dead objects, calling
    /// `each` for every object written.
    ///
    /// # Safety
    ///
    /// As for [`DeadObject::format`].
    pub(crate) unsafe fn format_span(addr: usize, len: usize, mut each: impl FnMut(ObjectRef)) {
        let mut addr = addr;
        let mut remaining = len;
        while remaining > 0 {
            let mut chunk = remaining.min(MAXIMUM_OBJECT_SIZE);
            if remaining - chunk != 0 && remaining - chunk < MINIMUM_OBJECT_SIZE {
                chunk -= MINIMUM_OBJECT_SIZE;
            }
            each(unsafe { Self::format(addr, chunk) });
            addr += chunk;
            remaining -= chunk;
        }
    }

    /// # Safety
    ///
    /// `obj` must be a dead object.
    #[inline]
    pub(crate) unsafe fn next(obj: ObjectRef) -> ObjectRef {
        unsafe { (*obj.cast::<Self>()).next }
    }

    /// # Safety
    ///
    /// `obj` must be a dead object.
    #[inline]
    pub(crate) unsafe fn set_next(obj: ObjectRef, next: ObjectRef) {
        unsafe { (*obj.cast::<Self>()).next = next };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(std::mem::size_of::<ObjectHeader>(), 16);
        assert!(std::mem::size_of::<DeadObject>() <= MINIMUM_OBJECT_SIZE);
    }

    #[test]
    fn test_allocation_size() {
        assert_eq!(allocation_size(0), Some(MINIMUM_OBJECT_SIZE));
        assert_eq!(allocation_size(17), Some(MINIMUM_OBJECT_SIZE));
        assert_eq!(allocation_size(33), Some(48));
        assert_eq!(allocation_size(4096), Some(4096));
        assert_eq!(allocation_size(MAXIMUM_OBJECT_SIZE), Some(MAXIMUM_OBJECT_SIZE));
        assert_eq!(allocation_size(MAXIMUM_OBJECT_SIZE + 1), None);
    }

    #[test]
    fn test_behavior_word_round_trip() {
        let cases = [
            Behavior::Primitive(0),
            Behavior::Primitive(TypeNumber::MAX),
            Behavior::Object(ObjectRef::from_addr(0x7f00_0000_1230)),
            Behavior::SaveOffset(0x40),
        ];
        for behavior in cases {
            assert_eq!(BehaviorWord::encode(behavior).decode(), Some(behavior));
        }
        assert_eq!(BehaviorWord::default().decode(), None);
    }

    #[test]
    fn test_mark_word_epochs() {
        let mut header = ObjectHeader::new();
        header.initialize(7, 32, true, MarkWord::INITIAL);
        assert!(header.is_live(MarkWord::INITIAL));

        let next = MarkWord::INITIAL.toggled();
        assert!(!header.is_live(next));
        header.set_live(next);
        assert!(header.is_live(next));
        assert_eq!(next.toggled(), MarkWord::INITIAL);
        assert_eq!(header.type_number(), 7);
        assert!(header.has_references());
    }

    #[test]
    fn test_behavior_object_flag() {
        let mut header = ObjectHeader::new();
        header.initialize(9, 48, false, MarkWord::INITIAL);
        assert!(header.behavior_object().is_null());

        let behavior = ObjectRef::from_addr(0x1000);
        header.set_behavior(Behavior::Object(behavior));
        assert!(header.has_object_behavior());
        assert_eq!(header.behavior_object(), behavior);

        header.set_behavior(Behavior::Primitive(9));
        assert!(!header.has_object_behavior());
        assert_eq!(header.type_number(), 9);
    }

    #[test]
    fn test_format_span_chunks() {
        let mut buf = vec![0u128; 16];
        let addr = buf.as_mut_ptr() as usize;
        let mut count = 0;
        unsafe { DeadObject::format_span(addr, 256, |_| count += 1) };
        assert_eq!(count, 1);
        let header = unsafe { ObjectRef::from_addr(addr).header() };
        assert!(header.is_dead_object());
        assert_eq!(header.size(), 256);
    }
}
