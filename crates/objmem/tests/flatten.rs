//! Flatten and unflatten.

mod common;

use common::{chain, config, memory, registry, values, Leaf, Node};
use objmem::{Behavior, ImageError, Memory, MemoryConfig, MemoryError, ObjectRef};

#[test]
fn test_round_trip_preserves_structure() {
    let mut memory = memory();
    let head = chain(&mut memory, &[1, 2, 3]);
    memory.push_root(head);

    let bytes = memory.flatten(head).unwrap();
    let copy = memory.unflatten(&bytes).unwrap();
    assert_ne!(copy, head);
    assert_eq!(values(&memory, copy), vec![1, 2, 3]);
    assert_eq!(values(&memory, head), vec![1, 2, 3]);
    memory.verify_heap().unwrap();
}

#[test]
fn test_cycle_back_to_root() {
    let mut memory = memory();
    let a = memory.new_object(Node::new(1, ObjectRef::NULL)).unwrap();
    memory.push_root(a);
    let b = memory.new_object(Node::new(2, a)).unwrap();
    memory.write_field::<Node>(a, |node| &mut node.next, b);

    let bytes = memory.flatten(a).unwrap();
    let copy = memory.unflatten(&bytes).unwrap();
    let copy_b = memory.get::<Node>(copy).next;
    assert_eq!(memory.get::<Node>(copy_b).value, 2);
    assert_eq!(memory.get::<Node>(copy_b).next, copy);
}

#[test]
fn test_shared_objects_are_copied_once() {
    let mut memory = memory();
    let shared = memory.new_object(Leaf::new(5)).unwrap();
    memory.push_root(shared);
    let array = memory.new_array(3).unwrap();
    memory.push_root(array);
    for index in 0..3 {
        memory.array_put(array, index, shared);
    }

    let bytes = memory.flatten(array).unwrap();
    // Carrier array, the array and one leaf.
    assert_eq!(bytes.len(), 32 + 48 + 32);

    let copy = memory.unflatten(&bytes).unwrap();
    let first = memory.array_get(copy, 0).unwrap();
    assert_ne!(first, shared);
    assert!((0..3).all(|index| memory.array_get(copy, index) == Some(first)));
}

#[test]
fn test_behavior_travels_with_the_object() {
    let mut memory = memory();
    let behavior = memory.new_behavior(ObjectRef::NULL, ObjectRef::NULL).unwrap();
    memory.push_root(behavior);
    let leaf = memory.new_object(Leaf::new(3)).unwrap();
    memory.push_root(leaf);
    memory.set_behavior(leaf, behavior).unwrap();

    let bytes = memory.flatten(leaf).unwrap();
    assert_eq!(memory.behavior_of(leaf), Some(Behavior::Object(behavior)));

    let copy = memory.unflatten(&bytes).unwrap();
    let Some(Behavior::Object(copied)) = memory.behavior_of(copy) else {
        panic!("copy lost its behavior");
    };
    assert_ne!(copied, behavior);
    assert!(memory.is_allocated(copied));
}

#[test]
fn test_unflattened_objects_survive_only_if_reachable() {
    let mut memory = memory();
    let head = chain(&mut memory, &[1, 2]);
    memory.push_root(head);
    let bytes = memory.flatten(head).unwrap();

    let kept = memory.unflatten(&bytes).unwrap();
    memory.push_root(kept);
    let dropped = memory.unflatten(&bytes).unwrap();

    memory.collect().unwrap();
    assert_eq!(values(&memory, kept), vec![1, 2]);
    assert!(!memory.is_allocated(dropped));
    memory.verify_heap().unwrap();
}

#[test]
fn test_unflatten_into_another_heap() {
    let mut source = memory();
    let head = chain(&mut source, &[4, 5, 6]);
    let weak = source.new_weak_reference(head).unwrap();
    let array = source.new_array(2).unwrap();
    source.array_put(array, 0, head);
    source.array_put(array, 1, weak);
    let bytes = source.flatten(array).unwrap();

    let mut target = Memory::new(config(), registry()).unwrap();
    let copy = target.unflatten(&bytes).unwrap();
    target.push_root(copy);
    let copy_head = target.array_get(copy, 0).unwrap();
    let copy_weak = target.array_get(copy, 1).unwrap();
    assert_eq!(values(&target, copy_head), vec![4, 5, 6]);
    assert_eq!(target.weak_get(copy_weak), copy_head);
    assert!(target.weak_references().contains(copy_weak));

    target.write_field::<Node>(copy_head, |node| &mut node.next, ObjectRef::NULL);
    target.array_put(copy, 0, ObjectRef::NULL);
    let metrics = target.collect().unwrap();
    assert_eq!(metrics.weak_refs_cleared, 1);
    assert!(target.weak_get(copy_weak).is_null());
}

#[test]
fn test_corrupt_buffer_is_rejected() {
    let mut memory = memory();
    let head = chain(&mut memory, &[1, 2]);
    memory.push_root(head);
    let mut bytes = memory.flatten(head).unwrap();

    // Point the carrier's slot into the middle of an object.
    bytes[24..32].copy_from_slice(&40u64.to_le_bytes());
    assert!(matches!(
        memory.unflatten(&bytes),
        Err(MemoryError::Image(ImageError::Corrupt { .. }))
    ));
    memory.verify_heap().unwrap();
    assert_eq!(values(&memory, head), vec![1, 2]);

    assert!(matches!(
        memory.unflatten(&[0; 8]),
        Err(MemoryError::Image(ImageError::Corrupt { .. }))
    ));
}

#[test]
fn test_flatten_too_large() {
    let config = MemoryConfig {
        max_image_size: 64,
        ..config()
    };
    let mut memory = Memory::new(config, registry()).unwrap();
    let head = chain(&mut memory, &[1, 2, 3]);
    memory.push_root(head);
    assert!(matches!(
        memory.flatten(head),
        Err(MemoryError::Image(ImageError::TooLarge { max: 64 }))
    ));
    assert_eq!(values(&memory, head), vec![1, 2, 3]);
}
