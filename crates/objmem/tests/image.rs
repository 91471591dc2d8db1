//! Image save and restore.

mod common;

use common::{chain, config, memory, registry, values, Leaf, Node};
use objmem::{
    Anchor, Behavior, HeapState, ImageError, Memory, MemoryConfig, MemoryError, ObjectRef,
    ARRAY_TYPE, BEHAVIOR_TYPE, IMAGE_HEADER_SIZE, RAW_OBJECT_TYPE,
};

/// Builds a heap with a little of everything hanging off the anchors:
/// environment -> [chain 1 -> 2 -> 3, "hello", weak -> chain head, leaf].
fn populated() -> Memory {
    let mut memory = memory();
    let env = memory.new_array(4).unwrap();
    memory.set_anchor(Anchor::Environment, env);

    let head = chain(&mut memory, &[1, 2, 3]);
    memory.array_put(env, 0, head);

    let text = memory.allocate(32).unwrap();
    memory.bytes_mut(text)[..5].copy_from_slice(b"hello");
    memory.array_put(env, 1, text);

    let weak = memory.new_weak_reference(head).unwrap();
    memory.array_put(env, 2, weak);

    let behavior = memory.new_behavior(env, ObjectRef::NULL).unwrap();
    let leaf = memory.new_object(Leaf::new(99)).unwrap();
    memory.set_behavior(leaf, behavior).unwrap();
    memory.array_put(env, 3, leaf);

    let nil = memory.allocate(32).unwrap();
    memory.set_anchor(Anchor::Nil, nil);

    // Unreachable garbage that must not be saved.
    chain(&mut memory, &[7, 8]);
    memory
}

fn check_restored(memory: &Memory) {
    let env = memory.anchor(Anchor::Environment);
    assert_eq!(memory.type_of(env), ARRAY_TYPE);
    assert_eq!(memory.array_len(env), 4);

    let head = memory.array_get(env, 0).unwrap();
    assert_eq!(values(memory, head), vec![1, 2, 3]);

    let text = memory.array_get(env, 1).unwrap();
    assert_eq!(memory.type_of(text), RAW_OBJECT_TYPE);

    let weak = memory.array_get(env, 2).unwrap();
    assert_eq!(memory.weak_get(weak), head);
    assert!(memory.weak_references().contains(weak));

    let leaf = memory.array_get(env, 3).unwrap();
    assert_eq!(memory.get::<Leaf>(leaf).value, 99);
    let Some(Behavior::Object(behavior)) = memory.behavior_of(leaf) else {
        panic!("leaf lost its behavior");
    };
    assert_eq!(memory.type_of(behavior), BEHAVIOR_TYPE);
    assert_eq!(memory.get::<objmem::BehaviorObject>(behavior).owning_class, env);

    assert_eq!(memory.type_of(memory.anchor(Anchor::Nil)), RAW_OBJECT_TYPE);
    assert!(memory.anchor(Anchor::True).is_null());
    assert!(unsafe { head.header() }.is_old_space());
}

#[test]
fn test_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("heap.image");

    let mut memory = populated();
    let written = memory.save_image_file(&path).unwrap();
    assert_eq!(written as u64, std::fs::metadata(&path).unwrap().len());

    let config = MemoryConfig {
        image_path: Some(path),
        ..config()
    };
    let mut restored = Memory::initialize(config, registry(), true).unwrap();
    check_restored(&restored);
    restored.verify_heap().unwrap();

    let env = restored.anchor(Anchor::Environment);
    let text = restored.array_get(env, 1).unwrap();
    assert_eq!(&restored.bytes_mut(text)[..5], b"hello");
}

#[test]
fn test_image_holds_exactly_the_reachable_graph() {
    let mut memory = populated();
    let bytes = memory.save_image().unwrap();
    let restored = Memory::restore(config(), registry(), &bytes).unwrap();

    let profile = restored.memory_profile();
    assert_eq!(profile["Node"].objects, 3);
    assert_eq!(profile["Leaf"].objects, 1);
    assert_eq!(profile["WeakReference"].objects, 1);
    assert_eq!(profile["Behavior"].objects, 1);
    assert_eq!(profile["RawObject"].objects, 2);
    // The environment plus the save array.
    assert_eq!(profile["Array"].objects, 2);

    let body = u64::from_le_bytes(bytes[..IMAGE_HEADER_SIZE].try_into().unwrap());
    assert_eq!(body as usize, bytes.len() - IMAGE_HEADER_SIZE);
    let total: usize = profile.values().map(|usage| usage.bytes).sum();
    assert_eq!(total, bytes.len() - IMAGE_HEADER_SIZE);
}

#[test]
fn test_restored_heap_keeps_working() {
    let mut memory = populated();
    let bytes = memory.save_image().unwrap();
    let mut restored = Memory::restore(config(), registry(), &bytes).unwrap();

    let metrics = restored.collect().unwrap();
    assert_eq!(metrics.objects_reclaimed, 0);
    check_restored(&restored);

    let env = restored.anchor(Anchor::Environment);
    let young = restored.new_object(Leaf::new(5)).unwrap();
    restored.array_put(env, 3, young);
    assert_eq!(restored.old_to_new().count(young), 1);
    restored.collect().unwrap();
    assert_eq!(restored.get::<Leaf>(young).value, 5);

    let head = restored.array_get(env, 0).unwrap();
    let node = restored.new_object(Node::new(0, head)).unwrap();
    restored.push_root(node);
    restored.collect().unwrap();
    assert_eq!(values(&restored, node), vec![0, 1, 2, 3]);
}

#[test]
fn test_save_consumes_the_heap() {
    let mut memory = populated();
    memory.save_image().unwrap();
    assert_eq!(memory.state(), HeapState::ImageSaved);
    assert!(matches!(memory.allocate(32), Err(MemoryError::HeapConsumed)));
    assert!(matches!(memory.collect(), Err(MemoryError::HeapConsumed)));
    assert!(matches!(memory.save_image(), Err(MemoryError::HeapConsumed)));
}

#[test]
fn test_save_too_large() {
    let config = MemoryConfig {
        max_image_size: 256,
        ..config()
    };
    let mut memory = Memory::new(config, registry()).unwrap();
    let env = memory.new_array(16).unwrap();
    memory.set_anchor(Anchor::Environment, env);
    for index in 0..16 {
        let leaf = memory.new_object(Leaf::new(index)).unwrap();
        memory.array_put(env, index as usize, leaf);
    }
    assert!(matches!(
        memory.save_image(),
        Err(MemoryError::Image(ImageError::TooLarge { max: 256 }))
    ));
}

#[test]
fn test_truncated_image_is_rejected() {
    let mut memory = populated();
    let bytes = memory.save_image().unwrap();

    let short = &bytes[..bytes.len() - 16];
    assert!(matches!(
        Memory::restore(config(), registry(), short),
        Err(MemoryError::Image(ImageError::Truncated { .. }))
    ));
    assert!(matches!(
        Memory::restore(config(), registry(), &[]),
        Err(MemoryError::Image(ImageError::Truncated { .. }))
    ));
}

#[test]
fn test_unknown_type_is_rejected() {
    let mut memory = populated();
    let mut bytes = memory.save_image().unwrap();

    // The type number is the upper half of the flag word at offset 12.
    let flags = IMAGE_HEADER_SIZE + 12;
    bytes[flags + 2..flags + 4].copy_from_slice(&999u16.to_le_bytes());
    assert!(matches!(
        Memory::restore(config(), registry(), &bytes),
        Err(MemoryError::Image(ImageError::UnknownType {
            offset: 0,
            type_number: 999
        }))
    ));
}

#[test]
fn test_image_must_start_with_save_array() {
    let mut memory = memory();
    let leaf = memory.new_object(Leaf::new(1)).unwrap();
    let flat = memory.flatten(leaf).unwrap();

    // A one-slot carrier array is too short to hold every anchor.
    let mut bytes = (flat.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(&flat);
    assert!(matches!(
        Memory::restore(config(), registry(), &bytes),
        Err(MemoryError::Image(ImageError::MissingSaveArray))
    ));
}

#[test]
fn test_restoring_needs_a_path() {
    assert!(matches!(
        Memory::initialize(config(), registry(), true),
        Err(MemoryError::Config(_))
    ));

    let dir = tempfile::tempdir().unwrap();
    let config = MemoryConfig {
        image_path: Some(dir.path().join("missing.image")),
        ..config()
    };
    assert!(matches!(
        Memory::initialize(config, registry(), true),
        Err(MemoryError::Image(ImageError::Io { .. }))
    ));
}

