//! Finalization ("uninit") tests.

mod common;

use std::cell::{Cell, RefCell};

use common::config;
use objmem::{
    HeapObject, Memory, MemoryError, ObjectHeader, ObjectRef, TypeRegistry, UninitState,
};

#[derive(HeapObject, Debug)]
#[repr(C)]
struct Resource {
    header: ObjectHeader,
    handle: u64,
}

#[derive(HeapObject, Debug)]
#[repr(C)]
struct Phoenix {
    header: ObjectHeader,
    lives: u64,
}

#[derive(HeapObject, Debug)]
#[repr(C)]
struct Faulty {
    header: ObjectHeader,
}

thread_local! {
    static CLOSED: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
    static REBORN: Cell<usize> = const { Cell::new(0) };
    static STATE_DURING_FINALIZER: Cell<Option<Option<UninitState>>> = const { Cell::new(None) };
    static NESTED_RUN: Cell<Option<usize>> = const { Cell::new(None) };
}

fn close_resource(memory: &mut Memory, obj: ObjectRef) {
    let handle = memory.get::<Resource>(obj).handle;
    CLOSED.with(|closed| closed.borrow_mut().push(handle));
    NESTED_RUN.with(|nested| nested.set(Some(memory.run_uninits())));
}

fn rise_again(memory: &mut Memory, obj: ObjectRef) {
    REBORN.with(|count| count.set(count.get() + 1));
    STATE_DURING_FINALIZER.with(|state| state.set(Some(memory.uninit_table().state(obj))));
    assert!(memory.register_finalizer(obj).unwrap());
}

fn fail(_memory: &mut Memory, _obj: ObjectRef) {
    panic!("finalizer failure");
}

fn memory() -> Memory {
    let mut registry = TypeRegistry::new();
    registry.register_with_uninit::<Resource>(close_resource);
    registry.register_with_uninit::<Phoenix>(rise_again);
    registry.register_with_uninit::<Faulty>(fail);
    Memory::new(config(), registry).unwrap()
}

fn closed() -> Vec<u64> {
    CLOSED.with(|closed| closed.borrow().clone())
}

#[test]
fn test_finalizer_runs_once() {
    let mut memory = memory();
    let x = memory
        .new_object(Resource {
            header: ObjectHeader::EMPTY,
            handle: 42,
        })
        .unwrap();
    assert!(memory.register_finalizer(x).unwrap());
    assert!(!memory.register_finalizer(x).unwrap());
    assert_eq!(memory.uninit_table().state(x), Some(UninitState::Registered));

    let metrics = memory.collect().unwrap();
    assert_eq!(metrics.uninits_flagged, 1);
    assert!(memory.is_finalization_pending(x));
    assert!(memory.is_allocated(x));
    assert!(closed().is_empty());

    assert_eq!(memory.run_uninits(), 1);
    assert_eq!(closed(), vec![42]);
    assert!(!memory.is_finalization_pending(x));
    assert!(memory.uninit_table().is_empty());
    assert_eq!(NESTED_RUN.with(Cell::get), Some(0));

    assert_eq!(memory.run_uninits(), 0);
    assert_eq!(closed(), vec![42]);
    assert_eq!(memory.counters().finalizers_run, 1);

    memory.collect().unwrap();
    assert!(!memory.is_allocated(x));
}

#[test]
fn test_pending_object_keeps_its_graph() {
    let mut memory = memory();
    let x = memory
        .new_object(Resource {
            header: ObjectHeader::EMPTY,
            handle: 7,
        })
        .unwrap();
    memory.register_finalizer(x).unwrap();

    memory.collect().unwrap();
    // Still pending after a second cycle, and not flagged twice.
    let metrics = memory.collect().unwrap();
    assert_eq!(metrics.uninits_flagged, 0);
    assert!(memory.is_finalization_pending(x));
    assert_eq!(memory.get::<Resource>(x).handle, 7);
}

#[test]
fn test_live_object_is_not_flagged() {
    let mut memory = memory();
    let x = memory
        .new_object(Resource {
            header: ObjectHeader::EMPTY,
            handle: 1,
        })
        .unwrap();
    memory.push_root(x);
    memory.register_finalizer(x).unwrap();

    let metrics = memory.collect().unwrap();
    assert_eq!(metrics.uninits_flagged, 0);
    assert_eq!(memory.run_uninits(), 0);
    assert_eq!(memory.uninit_table().state(x), Some(UninitState::Registered));
}

#[test]
fn test_reregistration_is_a_new_registration() {
    let mut memory = memory();
    let x = memory
        .new_object(Phoenix {
            header: ObjectHeader::EMPTY,
            lives: 9,
        })
        .unwrap();
    memory.register_finalizer(x).unwrap();

    assert_eq!(memory.collect_and_run_finalizers(false).unwrap(), 1);
    assert_eq!(REBORN.with(Cell::get), 1);
    assert_eq!(STATE_DURING_FINALIZER.with(Cell::get), Some(None));
    assert_eq!(memory.uninit_table().state(x), Some(UninitState::Registered));

    assert_eq!(memory.collect_and_run_finalizers(false).unwrap(), 1);
    assert_eq!(REBORN.with(Cell::get), 2);
    assert_eq!(memory.get::<Phoenix>(x).lives, 9);
}

#[test]
fn test_unregister_cancels_finalization() {
    let mut memory = memory();
    let x = memory
        .new_object(Resource {
            header: ObjectHeader::EMPTY,
            handle: 3,
        })
        .unwrap();
    memory.register_finalizer(x).unwrap();
    memory.collect().unwrap();
    assert!(memory.unregister_finalizer(x));
    assert!(!memory.unregister_finalizer(x));

    assert_eq!(memory.run_uninits(), 0);
    assert!(closed().is_empty());
    memory.collect().unwrap();
    assert!(!memory.is_allocated(x));
}

#[test]
fn test_panicking_finalizer_is_contained() {
    let mut memory = memory();
    for handle in [1, 2] {
        let resource = memory
            .new_object(Resource {
                header: ObjectHeader::EMPTY,
                handle,
            })
            .unwrap();
        memory.register_finalizer(resource).unwrap();
    }
    let faulty = memory
        .new_object(Faulty {
            header: ObjectHeader::EMPTY,
        })
        .unwrap();
    memory.register_finalizer(faulty).unwrap();

    assert_eq!(memory.collect_and_run_finalizers(false).unwrap(), 3);
    let mut handles = closed();
    handles.sort_unstable();
    assert_eq!(handles, vec![1, 2]);
    assert_eq!(memory.counters().finalizers_run, 2);
    assert_eq!(memory.counters().finalizer_failures, 1);
    assert!(memory.uninit_table().is_empty());
}

#[test]
fn test_register_rejects_foreign_objects() {
    let mut memory = memory();
    assert!(matches!(
        memory.register_finalizer(ObjectRef::NULL),
        Err(MemoryError::NotInHeap(0))
    ));
}
