//! Heap object types and the registry that dispatches on them.
//!
//! Every object carries a primitive type number in its header. The collector
//! never looks at the behavior word to decide how to trace an object; it looks
//! the type number up in the [`TypeRegistry`] and calls the registered `live`
//! or `live_general` callback.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem::size_of;

use crate::mark::{MarkHandler, Marker};
use crate::memory::Memory;
use crate::object::{ObjectHeader, ObjectRef};

/// Primitive type number stored in every header.
pub type TypeNumber = u16;

/// Free spans.
pub const DEAD_TYPE: TypeNumber = 0;
/// Untyped byte payload with no references.
pub const RAW_OBJECT_TYPE: TypeNumber = 1;
/// Counted array of references.
pub const ARRAY_TYPE: TypeNumber = 2;
/// Weak reference node.
pub const WEAK_REFERENCE_TYPE: TypeNumber = 3;
/// Heap-resident behavior.
pub const BEHAVIOR_TYPE: TypeNumber = 4;
/// First number handed out by [`TypeRegistry::register`].
pub const FIRST_USER_TYPE: TypeNumber = 16;

// ============================================================================
// HeapObject
// ============================================================================

/// A type that lives in the managed heap.
///
/// Implementations are usually generated by `#[derive(HeapObject)]`.
///
/// # Safety
///
/// The type must be `#[repr(C)]` and start with an [`ObjectHeader`]. It must
/// not need its destructor to run, since the heap never drops objects. `live`
/// and `live_general` must hand every [`ObjectRef`] field the object owns to
/// the marker or handler, and nothing else. If `HAS_REFERENCES` is `false` the
/// type must hold no references at all.
pub unsafe trait HeapObject: Sized + 'static {
    /// Name used in diagnostics and memory profiles.
    const NAME: &'static str;

    /// Whether instances may hold references and must be traced.
    const HAS_REFERENCES: bool = true;

    /// Ordinary collection callback.
    fn live(&mut self, marker: &mut Marker<'_>);

    /// Reason-parameterized callback used by every non-collecting traversal.
    fn live_general(&mut self, handler: &mut dyn MarkHandler);
}

/// Per-field tracing used by the derive macro.
///
/// Implemented for [`ObjectRef`], the primitive scalars, fixed arrays and
/// [`PhantomData`], so a struct made of such fields can derive [`HeapObject`].
pub trait Slots {
    /// Whether values of this type hold references.
    const HAS_REFERENCES: bool;

    fn live_slots(&mut self, marker: &mut Marker<'_>);

    fn live_general_slots(&mut self, handler: &mut dyn MarkHandler);
}

impl Slots for ObjectRef {
    const HAS_REFERENCES: bool = true;

    #[inline]
    fn live_slots(&mut self, marker: &mut Marker<'_>) {
        marker.mark_object(*self);
    }

    #[inline]
    fn live_general_slots(&mut self, handler: &mut dyn MarkHandler) {
        handler.mark(self);
    }
}

impl<T: Slots, const N: usize> Slots for [T; N] {
    const HAS_REFERENCES: bool = T::HAS_REFERENCES;

    fn live_slots(&mut self, marker: &mut Marker<'_>) {
        if T::HAS_REFERENCES {
            for slot in self {
                slot.live_slots(marker);
            }
        }
    }

    fn live_general_slots(&mut self, handler: &mut dyn MarkHandler) {
        if T::HAS_REFERENCES {
            for slot in self {
                slot.live_general_slots(handler);
            }
        }
    }
}

impl<T: ?Sized> Slots for PhantomData<T> {
    const HAS_REFERENCES: bool = false;

    fn live_slots(&mut self, _marker: &mut Marker<'_>) {}

    fn live_general_slots(&mut self, _handler: &mut dyn MarkHandler) {}
}

macro_rules! leaf_slots {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Slots for $ty {
                const HAS_REFERENCES: bool = false;

                #[inline]
                fn live_slots(&mut self, _marker: &mut Marker<'_>) {}

                #[inline]
                fn live_general_slots(&mut self, _handler: &mut dyn MarkHandler) {}
            }
        )*
    };
}

leaf_slots!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    ObjectHeader,
);

// ============================================================================
// Built-in types
// ============================================================================

/// Untyped storage. The payload follows the header.
#[repr(C)]
#[derive(Debug)]
pub struct RawObject {
    pub header: ObjectHeader,
}

impl RawObject {
    /// The payload of a raw object: every byte after the header.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object and no other borrow of its payload may be
    /// active.
    #[must_use]
    pub unsafe fn bytes_mut<'a>(obj: ObjectRef) -> &'a mut [u8] {
        let header = unsafe { obj.header() };
        let len = header.size() - size_of::<ObjectHeader>();
        let start = (obj.addr() + size_of::<ObjectHeader>()) as *mut u8;
        unsafe { std::slice::from_raw_parts_mut(start, len) }
    }
}

unsafe impl HeapObject for RawObject {
    const NAME: &'static str = "RawObject";
    const HAS_REFERENCES: bool = false;

    fn live(&mut self, _marker: &mut Marker<'_>) {}

    fn live_general(&mut self, _handler: &mut dyn MarkHandler) {}
}

/// A counted array of references. The slots follow the fixed part.
#[repr(C)]
#[derive(Debug)]
pub struct Array {
    pub header: ObjectHeader,
    len: usize,
}

impl Array {
    /// Bytes needed for an array of `len` slots, before grain rounding.
    #[must_use]
    pub const fn size_for(len: usize) -> Option<usize> {
        match len.checked_mul(size_of::<ObjectRef>()) {
            Some(bytes) => bytes.checked_add(size_of::<Self>()),
            None => None,
        }
    }

    /// Number of slots.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len;
    }

    /// The slots of the array at `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be a live array and no other borrow of its slots may be
    /// active.
    #[must_use]
    pub unsafe fn slots<'a>(obj: ObjectRef) -> &'a mut [ObjectRef] {
        let len = unsafe { obj.as_ref::<Self>() }.len;
        let start = (obj.addr() + size_of::<Self>()) as *mut ObjectRef;
        unsafe { std::slice::from_raw_parts_mut(start, len) }
    }
}

unsafe fn array_live(obj: ObjectRef, marker: &mut Marker<'_>) {
    for slot in unsafe { Array::slots(obj) } {
        marker.mark_object(*slot);
    }
}

unsafe fn array_live_general(obj: ObjectRef, handler: &mut dyn MarkHandler) {
    for slot in unsafe { Array::slots(obj) } {
        handler.mark(slot);
    }
}

/// A behavior that lives in the heap, as opposed to a primitive behavior
/// encoded in the header word.
#[repr(C)]
#[derive(Debug)]
pub struct BehaviorObject {
    pub header: ObjectHeader,
    pub owning_class: ObjectRef,
    pub method_dictionary: ObjectRef,
}

unsafe impl HeapObject for BehaviorObject {
    const NAME: &'static str = "Behavior";

    fn live(&mut self, marker: &mut Marker<'_>) {
        marker.mark_object(self.owning_class);
        marker.mark_object(self.method_dictionary);
    }

    fn live_general(&mut self, handler: &mut dyn MarkHandler) {
        handler.mark(&mut self.owning_class);
        handler.mark(&mut self.method_dictionary);
    }
}

// ============================================================================
// TypeRegistry
// ============================================================================

/// Ordinary collection callback as stored in the registry.
pub type LiveFn = unsafe fn(ObjectRef, &mut Marker<'_>);
/// General traversal callback as stored in the registry.
pub type LiveGeneralFn = unsafe fn(ObjectRef, &mut dyn MarkHandler);
/// Finalizer run for a dead object registered with
/// [`Memory::register_finalizer`]. The object is still readable while it runs.
pub type UninitFn = fn(&mut Memory, ObjectRef);

/// Dispatch entry for one type number.
#[derive(Clone, Copy)]
pub struct TypeInfo {
    pub name: &'static str,
    pub has_references: bool,
    /// Smallest instance size in bytes, header included. Allocation requests
    /// below it are rounded up.
    pub min_size: usize,
    pub(crate) live: LiveFn,
    pub(crate) live_general: LiveGeneralFn,
    pub(crate) uninit: Option<UninitFn>,
}

impl TypeInfo {
    /// Whether the type has a finalizer.
    #[must_use]
    pub const fn has_uninit(&self) -> bool {
        self.uninit.is_some()
    }
}

impl std::fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("has_references", &self.has_references)
            .field("min_size", &self.min_size)
            .field("has_uninit", &self.uninit.is_some())
            .finish_non_exhaustive()
    }
}

unsafe fn live_thunk<T: HeapObject>(obj: ObjectRef, marker: &mut Marker<'_>) {
    unsafe { obj.as_mut::<T>() }.live(marker);
}

unsafe fn live_general_thunk<T: HeapObject>(obj: ObjectRef, handler: &mut dyn MarkHandler) {
    unsafe { obj.as_mut::<T>() }.live_general(handler);
}

unsafe fn no_live(_obj: ObjectRef, _marker: &mut Marker<'_>) {}

unsafe fn no_live_general(_obj: ObjectRef, _handler: &mut dyn MarkHandler) {}

/// Maps type numbers to their tracing callbacks.
///
/// Type numbers are assigned in registration order. An image can only be
/// restored by a registry built with the same registrations in the same order.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: Vec<Option<TypeInfo>>,
    by_rust_type: HashMap<TypeId, TypeNumber>,
    next: TypeNumber,
}

impl TypeRegistry {
    /// Creates a registry holding the built-in types.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            types: Vec::new(),
            by_rust_type: HashMap::new(),
            next: FIRST_USER_TYPE,
        };
        registry.install(
            DEAD_TYPE,
            TypeInfo {
                name: "Dead",
                has_references: false,
                min_size: size_of::<ObjectHeader>(),
                live: no_live,
                live_general: no_live_general,
                uninit: None,
            },
        );
        registry.install_rust::<RawObject>(RAW_OBJECT_TYPE, None);
        registry.install(
            ARRAY_TYPE,
            TypeInfo {
                name: "Array",
                has_references: true,
                min_size: size_of::<Array>(),
                live: array_live,
                live_general: array_live_general,
                uninit: None,
            },
        );
        registry
            .by_rust_type
            .insert(TypeId::of::<Array>(), ARRAY_TYPE);
        registry.install_rust::<crate::weak::WeakReference>(WEAK_REFERENCE_TYPE, None);
        registry.install_rust::<BehaviorObject>(BEHAVIOR_TYPE, None);
        registry
    }

    fn install(&mut self, number: TypeNumber, info: TypeInfo) {
        let index = usize::from(number);
        if self.types.len() <= index {
            self.types.resize(index + 1, None);
        }
        self.types[index] = Some(info);
    }

    fn install_rust<T: HeapObject>(&mut self, number: TypeNumber, uninit: Option<UninitFn>) {
        self.install(
            number,
            TypeInfo {
                name: T::NAME,
                has_references: T::HAS_REFERENCES,
                min_size: size_of::<T>(),
                live: live_thunk::<T>,
                live_general: live_general_thunk::<T>,
                uninit,
            },
        );
        self.by_rust_type.insert(TypeId::of::<T>(), number);
    }

    fn next_number(&mut self) -> TypeNumber {
        let number = self.next;
        self.next = self
            .next
            .checked_add(1)
            .unwrap_or_else(|| panic!("type registry exhausted {} type numbers", TypeNumber::MAX));
        number
    }

    /// Registers `T` and returns its type number. Registering the same type
    /// twice returns the existing number.
    pub fn register<T: HeapObject>(&mut self) -> TypeNumber {
        if let Some(&number) = self.by_rust_type.get(&TypeId::of::<T>()) {
            return number;
        }
        let number = self.next_number();
        self.install_rust::<T>(number, None);
        number
    }

    /// Registers `T` with a finalizer run when a registered instance dies.
    pub fn register_with_uninit<T: HeapObject>(&mut self, uninit: UninitFn) -> TypeNumber {
        let number = self.register::<T>();
        if let Some(Some(info)) = self.types.get_mut(usize::from(number)) {
            info.uninit = Some(uninit);
        }
        number
    }

    /// Registers an opaque type tag for objects allocated with
    /// [`Memory::allocate_typed`]. Such objects hold no references.
    pub fn register_opaque(&mut self, name: &'static str) -> TypeNumber {
        let number = self.next_number();
        self.install(
            number,
            TypeInfo {
                name,
                has_references: false,
                min_size: size_of::<ObjectHeader>(),
                live: no_live,
                live_general: no_live_general,
                uninit: None,
            },
        );
        number
    }

    /// Looks up a type number.
    #[must_use]
    pub fn get(&self, number: TypeNumber) -> Option<&TypeInfo> {
        self.types.get(usize::from(number)).and_then(Option::as_ref)
    }

    /// The type number registered for `T`, if any.
    #[must_use]
    pub fn number_of<T: HeapObject>(&self) -> Option<TypeNumber> {
        self.by_rust_type.get(&TypeId::of::<T>()).copied()
    }

    /// Number of registered types, built-ins included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.iter().filter(|info| info.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Pair {
        header: ObjectHeader,
        left: ObjectRef,
        right: ObjectRef,
    }

    unsafe impl HeapObject for Pair {
        const NAME: &'static str = "Pair";

        fn live(&mut self, marker: &mut Marker<'_>) {
            marker.mark_object(self.left);
            marker.mark_object(self.right);
        }

        fn live_general(&mut self, handler: &mut dyn MarkHandler) {
            handler.mark(&mut self.left);
            handler.mark(&mut self.right);
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.get(DEAD_TYPE).unwrap().name, "Dead");
        assert_eq!(registry.get(ARRAY_TYPE).unwrap().name, "Array");
        assert!(!registry.get(RAW_OBJECT_TYPE).unwrap().has_references);
        assert!(registry.get(WEAK_REFERENCE_TYPE).unwrap().has_references);
        assert_eq!(registry.number_of::<BehaviorObject>(), Some(BEHAVIOR_TYPE));
        assert!(registry.get(5).is_none());
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = TypeRegistry::new();
        let first = registry.register::<Pair>();
        assert_eq!(first, FIRST_USER_TYPE);
        assert_eq!(registry.register::<Pair>(), first);
        let opaque = registry.register_opaque("Blob");
        assert_eq!(opaque, FIRST_USER_TYPE + 1);
        assert_eq!(registry.get(opaque).unwrap().name, "Blob");
    }

    #[test]
    fn test_register_with_uninit() {
        fn finalize(_memory: &mut Memory, _obj: ObjectRef) {}

        let mut registry = TypeRegistry::new();
        let number = registry.register_with_uninit::<Pair>(finalize);
        assert!(registry.get(number).unwrap().has_uninit());
    }

    #[test]
    fn test_slots_reference_flags() {
        assert!(<ObjectRef as Slots>::HAS_REFERENCES);
        assert!(<[ObjectRef; 3] as Slots>::HAS_REFERENCES);
        assert!(!<[u64; 3] as Slots>::HAS_REFERENCES);
        assert!(!<PhantomData<ObjectRef> as Slots>::HAS_REFERENCES);
        assert_eq!(Array::size_for(2), Some(24 + 16));
        assert_eq!(Array::size_for(usize::MAX), None);
    }
}
