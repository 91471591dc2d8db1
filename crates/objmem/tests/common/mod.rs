//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use objmem::{HeapObject, Memory, MemoryConfig, ObjectHeader, ObjectRef, TypeRegistry};

/// A singly linked node.
#[derive(HeapObject, Debug)]
#[repr(C)]
pub struct Node {
    pub header: ObjectHeader,
    pub value: i64,
    pub next: ObjectRef,
}

impl Node {
    pub const fn new(value: i64, next: ObjectRef) -> Self {
        Self {
            header: ObjectHeader::EMPTY,
            value,
            next,
        }
    }
}

/// A leaf holding no references.
#[derive(HeapObject, Debug)]
#[repr(C)]
pub struct Leaf {
    pub header: ObjectHeader,
    pub value: u64,
}

impl Leaf {
    pub const fn new(value: u64) -> Self {
        Self {
            header: ObjectHeader::EMPTY,
            value,
        }
    }
}

/// Small pools and segments so tests exercise segment and pool turnover.
pub fn config() -> MemoryConfig {
    MemoryConfig {
        segment_size: 16 * 1024,
        large_segment_size: 64 * 1024,
        pool_size: 1024 * 1024,
        heap_limit: 64 * 1024 * 1024,
        large_block_threshold: 1024,
        live_stack_size: 16,
        save_stack_size: 4,
        max_image_size: 4 * 1024 * 1024,
        identity_table_size: 16,
        image_path: None,
    }
}

pub fn registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry.register::<Node>();
    registry.register::<Leaf>();
    registry
}

pub fn memory() -> Memory {
    Memory::new(config(), registry()).unwrap()
}

/// Builds `values[0] -> values[1] -> ...` and returns the head.
pub fn chain(memory: &mut Memory, values: &[i64]) -> ObjectRef {
    let mut next = ObjectRef::NULL;
    memory.push_frame();
    for value in values.iter().rev() {
        next = memory.new_object(Node::new(*value, next)).unwrap();
        memory.push_root(next);
    }
    memory.pop_frame();
    next
}

/// Reads the values along a chain.
pub fn values(memory: &Memory, head: ObjectRef) -> Vec<i64> {
    let mut out = Vec::new();
    let mut cur = head;
    while !cur.is_null() {
        let node = memory.get::<Node>(cur);
        out.push(node.value);
        cur = node.next;
    }
    out
}
