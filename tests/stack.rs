//! Conservative stack scanning smoke tests.
//!
//! Only positive assertions: a pointer held in a live local must keep
//! its object alive. Dead stack slots and spilled registers can keep
//! arbitrary extra objects alive, so "object died" can never be asserted
//! under a conservative scan.

use greyline::{Config, Heap, Roots, TypeDescriptor, Word};
use std::hint::black_box;

fn test_config() -> Config {
    Config {
        initial_heap_size: 4 * 1024 * 1024,
        max_heap_size: 8 * 1024 * 1024,
        gc_workers: Some(2),
        ..Config::default()
    }
}

fn leaf_descriptor(size: u32) -> *mut TypeDescriptor {
    let map = Box::leak(vec![-1i64].into_boxed_slice()).as_ptr();

    Box::leak(Box::new(TypeDescriptor {
        id: 1,
        size,
        is_array: false,
        ref_map: map,
    }))
}

fn install_stack_bottom(heap: &mut Heap, bottom: *const usize) {
    heap.set_roots(Roots {
        stack_bottom: bottom as *mut Word,
        modules: std::ptr::null_mut(),
        modules_size: 0,
        object_array_id: 100,
    });
}

/// Collects while `rooted` lives in a stack slot of this frame, which is
/// deeper than the registered stack bottom and therefore scanned.
#[inline(never)]
fn collect_with_rooted(heap: &mut Heap, rooted: usize) -> usize {
    let slot = [rooted];

    // The reference escapes, so the slot has to be a real stack location
    // holding the pointer for the duration of the collection.
    black_box(&slot);
    heap.collect_young();
    black_box(&slot);

    slot[0]
}

#[test]
fn test_stack_root_survives_collection() {
    let stack_bottom = 0usize;
    let mut heap = Heap::new(test_config());

    install_stack_bottom(&mut heap, &stack_bottom);

    let address = heap.allocate(16).unwrap();

    unsafe { *(address as *mut *mut TypeDescriptor) = leaf_descriptor(16) };

    let rooted = collect_with_rooted(&mut heap, address);

    assert!(
        heap.object_meta_for(rooted).is_allocated(),
        "a stack-held pointer must keep its object alive"
    );
}

#[test]
fn test_interior_pointer_keeps_object_alive() {
    let stack_bottom = 0usize;
    let mut heap = Heap::new(test_config());

    install_stack_bottom(&mut heap, &stack_bottom);

    let address = heap.allocate(64).unwrap();

    unsafe { *(address as *mut *mut TypeDescriptor) = leaf_descriptor(64) };

    // Hold only a pointer into the middle of the object.
    let interior = collect_with_rooted(&mut heap, address + 24);

    assert!(
        heap.object_meta_for(interior - 24).is_allocated(),
        "an interior pointer resolves to the containing object"
    );
}
