//! Allocator-level behaviour: bump paths, overflow, the large
//! allocator's free lists, the young-block budget and heap growth.

use greyline::config::{BLOCK_SIZE, LINE_SIZE};
use greyline::{Config, Heap, Roots, TypeDescriptor, Word};
use std::sync::atomic::Ordering;

const MODULE_SLOTS: usize = 64;

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

fn install_modules(heap: &mut Heap, modules: &mut Vec<*mut Word>) {
    heap.set_roots(Roots {
        stack_bottom: std::ptr::null_mut(),
        modules: modules.as_mut_ptr(),
        modules_size: MODULE_SLOTS,
        object_array_id: 100,
    });
}

#[test]
fn test_allocation_is_zeroed_and_aligned() {
    let mut heap = Heap::new(test_config());

    for _ in 0..100 {
        let address = heap.allocate(48).unwrap();

        assert_eq!(address % 16, 0);

        for offset in 0..6 {
            assert_eq!(unsafe { *((address as *const usize).add(offset)) }, 0);
        }
    }
}

#[test]
fn test_medium_objects_take_the_overflow_path() {
    let mut heap = Heap::new(test_config());

    let small = heap.allocate(16).unwrap();

    // Fill most of the current hole so the medium object cannot fit.
    while heap.allocate(16).map(|a| a % BLOCK_SIZE) != Ok(BLOCK_SIZE - 16) {}

    let medium = heap.allocate((LINE_SIZE + 16) as usize).unwrap();

    assert_ne!(
        heap.block_meta_for(small),
        heap.block_meta_for(medium),
        "overflow allocation uses its own block"
    );
}

#[test]
fn test_large_chunks_are_reused_from_free_lists() {
    let mut heap = Heap::new(test_config());

    // 2 KiB lands in the large allocator's free-list range: the first
    // allocation claims a block and parks the split remainder.
    let first = heap.allocate_large(2048).unwrap();
    let second = heap.allocate_large(2048).unwrap();

    assert_eq!(
        heap.block_meta_for(first),
        heap.block_meta_for(second),
        "the second chunk comes from the split remainder"
    );
    assert_eq!(second, first + 2048);

    assert!(heap.object_meta_for(first).is_allocated());
    assert!(heap.object_meta_for(second).is_allocated());
}

#[test]
fn test_young_budget_triggers_collection() {
    let mut heap = Heap::new(Config {
        max_young_blocks: Some(8),
        ..test_config()
    });

    // Nothing is rooted, so every block of garbage is recoverable; the
    // budget forces collections rather than failures.
    for _ in 0..BLOCK_SIZE {
        heap.allocate(64).unwrap();
    }

    assert!(heap.young_collections.load(Ordering::Relaxed) > 0);
    assert!(heap.block_allocator.young_blocks() <= 10);
}

#[test]
fn test_heap_grows_before_reporting_oom() {
    let mut heap = Heap::new(Config {
        initial_heap_size: 1024 * 1024,
        max_heap_size: 4 * 1024 * 1024,
        max_young_blocks: Some(1024),
        ..test_config()
    });
    let mut modules = vec![std::ptr::null_mut(); MODULE_SLOTS];

    install_modules(&mut heap, &mut modules);

    let rtti = leaf_descriptor(16);
    let initial_blocks = heap.block_allocator.limit.load(Ordering::Relaxed);

    // Keep forty 24 KiB objects alive: more than the initial 32 blocks
    // can hold, so the heap has to grow.
    for slot in 0..40 {
        let address = heap.allocate_large(24 * 1024).unwrap();

        unsafe { *(address as *mut *mut TypeDescriptor) = rtti };
        modules[slot] = address as *mut Word;
    }

    assert!(heap.block_allocator.limit.load(Ordering::Relaxed) > initial_blocks);
}

#[test]
fn test_exhausted_heap_reports_oom() {
    let mut heap = Heap::new(Config {
        initial_heap_size: 1024 * 1024,
        max_heap_size: 1024 * 1024,
        max_young_blocks: Some(1024),
        ..test_config()
    });
    let mut modules = vec![std::ptr::null_mut(); MODULE_SLOTS];

    install_modules(&mut heap, &mut modules);

    let rtti = leaf_descriptor(16);
    let mut failed = false;

    for slot in 0..MODULE_SLOTS {
        match heap.allocate_large(24 * 1024) {
            Ok(address) => {
                unsafe { *(address as *mut *mut TypeDescriptor) = rtti };
                modules[slot] = address as *mut Word;
            }
            Err(_) => {
                failed = true;
                break;
            }
        }
    }

    assert!(failed, "a 1 MiB heap cannot hold 64 rooted 24 KiB objects");
}

#[test]
fn test_pretenured_allocations_are_old_and_marked() {
    let mut heap = Heap::new(Config {
        pretenure: true,
        ..test_config()
    });

    let address = heap.allocate_pretenured(32).unwrap();
    let block = heap.block_meta_for(address);

    assert!(heap.object_meta_for(address).is_marked());
    assert!(block.is_old(heap.config.max_young_age));
    assert!(heap.block_allocator.old_blocks() > 0);
}

#[test]
fn test_recyclable_blocks_are_refilled_hole_first() {
    let mut heap = Heap::new(test_config());
    let mut modules = vec![std::ptr::null_mut(); MODULE_SLOTS];

    install_modules(&mut heap, &mut modules);

    let rtti = leaf_descriptor(16);

    // Pin one object per line across a few lines of the current block so
    // the sweep leaves a block with holes between marked lines.
    let mut pinned = Vec::new();

    for slot in 0..8 {
        let keeper = heap.allocate(16).unwrap();

        unsafe { *(keeper as *mut *mut TypeDescriptor) = rtti };
        modules[slot] = keeper as *mut Word;
        pinned.push(keeper);

        // Garbage padding filling the rest of the line.
        for _ in 0..7 {
            heap.allocate(16).unwrap();
        }
    }

    let pinned_block = heap.block_meta_for(pinned[0]);

    heap.collect_young();

    // Survivors stay; the rest of their lines is unusable, but the tail
    // lines of the block are holes again.
    for &keeper in &pinned {
        assert!(heap.object_meta_for(keeper).is_allocated());
    }

    assert_ne!(
        pinned_block.first_free_line(),
        greyline::meta::block_meta::LAST_HOLE,
        "the swept block records its first hole"
    );
}
