//! Tests for `#[derive(HeapObject)]`.

mod common;

use common::{config, Leaf, Node};
use objmem::{HeapObject, Memory, ObjectHeader, ObjectRef, Slots, TypeRegistry};

/// Fixed array of children plus a scalar.
#[derive(HeapObject, Debug)]
#[repr(C)]
struct Fan {
    header: ObjectHeader,
    children: [ObjectRef; 3],
    weight: u32,
}

/// Tuple struct.
#[derive(HeapObject, Debug)]
#[repr(C)]
struct Pair(ObjectHeader, ObjectRef, ObjectRef);

/// A cache slot the collector must not see.
#[derive(HeapObject, Debug)]
#[repr(C)]
struct Cached {
    header: ObjectHeader,
    owner: ObjectRef,
    #[objmem(skip)]
    cache: ObjectRef,
}

#[derive(HeapObject, Debug)]
#[repr(C)]
#[objmem(name = "Symbol")]
struct InternedSymbol {
    header: ObjectHeader,
    hash: u64,
}

#[derive(HeapObject, Debug)]
#[repr(C, align(16))]
struct Boxed<T: Slots> {
    header: ObjectHeader,
    item: T,
}

fn memory() -> Memory {
    let mut registry = TypeRegistry::new();
    registry.register::<Node>();
    registry.register::<Leaf>();
    registry.register::<Fan>();
    registry.register::<Pair>();
    registry.register::<Cached>();
    registry.register::<InternedSymbol>();
    registry.register::<Boxed<ObjectRef>>();
    registry.register::<Boxed<u64>>();
    Memory::new(config(), registry).unwrap()
}

#[test]
fn test_has_references() {
    assert!(Node::HAS_REFERENCES);
    assert!(!Leaf::HAS_REFERENCES);
    assert!(Fan::HAS_REFERENCES);
    assert!(Pair::HAS_REFERENCES);
    assert!(!InternedSymbol::HAS_REFERENCES);
    assert!(<Boxed<ObjectRef>>::HAS_REFERENCES);
    assert!(!<Boxed<u64>>::HAS_REFERENCES);
}

#[test]
fn test_names() {
    assert_eq!(Node::NAME, "Node");
    assert_eq!(InternedSymbol::NAME, "Symbol");

    let mut memory = memory();
    let symbol = memory
        .new_object(InternedSymbol {
            header: ObjectHeader::EMPTY,
            hash: 7,
        })
        .unwrap();
    memory.push_root(symbol);
    assert_eq!(memory.memory_profile()["Symbol"].objects, 1);
}

#[test]
fn test_array_field_is_traced() {
    let mut memory = memory();
    let fan = memory
        .new_object(Fan {
            header: ObjectHeader::EMPTY,
            children: [ObjectRef::NULL; 3],
            weight: 3,
        })
        .unwrap();
    memory.push_root(fan);
    for index in 0..3 {
        let leaf = memory.new_object(Leaf::new(index)).unwrap();
        memory.get_mut::<Fan>(fan).children[index as usize] = leaf;
    }

    let metrics = memory.collect().unwrap();
    assert_eq!(metrics.objects_marked, 4);
    let fan_ref = memory.get::<Fan>(fan);
    assert_eq!(fan_ref.weight, 3);
    for (index, child) in fan_ref.children.iter().enumerate() {
        assert_eq!(memory.get::<Leaf>(*child).value, index as u64);
    }
}

#[test]
fn test_tuple_struct_is_traced() {
    let mut memory = memory();
    let left = memory.new_object(Leaf::new(1)).unwrap();
    let right = memory.new_object(Leaf::new(2)).unwrap();
    let pair = memory
        .new_object(Pair(ObjectHeader::EMPTY, left, right))
        .unwrap();
    memory.push_root(pair);

    memory.collect().unwrap();
    assert!(memory.is_allocated(left));
    assert!(memory.is_allocated(right));
    assert_eq!(memory.get::<Leaf>(memory.get::<Pair>(pair).2).value, 2);
}

#[test]
fn test_skipped_field_is_not_traced() {
    let mut memory = memory();
    let owner = memory.new_object(Leaf::new(1)).unwrap();
    let cache = memory.new_object(Leaf::new(2)).unwrap();
    let cached = memory
        .new_object(Cached {
            header: ObjectHeader::EMPTY,
            owner,
            cache,
        })
        .unwrap();
    memory.push_root(cached);

    let metrics = memory.collect().unwrap();
    assert_eq!(metrics.objects_marked, 2);
    assert!(memory.is_allocated(owner));
    assert!(!memory.is_allocated(cache));
}

#[test]
fn test_generic_struct() {
    let mut memory = memory();
    let leaf = memory.new_object(Leaf::new(8)).unwrap();
    let boxed = memory
        .new_object(Boxed {
            header: ObjectHeader::EMPTY,
            item: leaf,
        })
        .unwrap();
    memory.push_root(boxed);
    let plain = memory
        .new_object(Boxed {
            header: ObjectHeader::EMPTY,
            item: 5u64,
        })
        .unwrap();
    memory.push_root(plain);

    memory.collect().unwrap();
    let item = memory.get::<Boxed<ObjectRef>>(boxed).item;
    assert_eq!(memory.get::<Leaf>(item).value, 8);
    assert_eq!(memory.get::<Boxed<u64>>(plain).item, 5);
}
