//! Whole-heap collection scenarios.
//!
//! These tests drive the collector through module roots (a flat buffer of
//! precise pointers) so survivorship assertions stay deterministic; the
//! conservative stack scan gets its own positive-only smoke test in
//! `stack.rs`, since dead stack slots can keep arbitrary extra objects
//! alive.

use greyline::config::GREY_PACKET_ITEMS;
use greyline::meta::block_meta::{FLAG_FREE, FLAG_SUPERBLOCK_START, FLAG_SUPERBLOCK_TAIL};
use greyline::{Config, Heap, Object, Ptr, Roots, TypeDescriptor, Word};
use std::sync::atomic::Ordering;

const OBJECT_ARRAY_ID: i32 = 100;
const MODULE_SLOTS: usize = 64;

struct TestHeap {
    heap: Box<Heap>,
    modules: Vec<*mut Word>,
}

impl TestHeap {
    fn new(config: Config) -> TestHeap {
        let mut heap = Heap::new(config);
        let mut modules = vec![std::ptr::null_mut(); MODULE_SLOTS];

        heap.set_roots(Roots {
            stack_bottom: std::ptr::null_mut(),
            modules: modules.as_mut_ptr(),
            modules_size: MODULE_SLOTS,
            object_array_id: OBJECT_ARRAY_ID,
        });

        TestHeap { heap, modules }
    }

    fn root(&mut self, slot: usize, address: usize) {
        self.modules[slot] = address as *mut Word;
    }
}

fn test_config() -> Config {
    Config {
        initial_heap_size: 4 * 1024 * 1024,
        max_heap_size: 8 * 1024 * 1024,
        gc_workers: Some(2),
        ..Config::default()
    }
}

fn descriptor(id: i32, size: u32, ref_map: Vec<i64>) -> *mut TypeDescriptor {
    let map = Box::leak(ref_map.into_boxed_slice()).as_ptr();

    Box::leak(Box::new(TypeDescriptor {
        id,
        size,
        is_array: false,
        ref_map: map,
    }))
}

fn array_descriptor() -> *mut TypeDescriptor {
    Box::leak(Box::new(TypeDescriptor {
        id: OBJECT_ARRAY_ID,
        size: 0,
        is_array: true,
        ref_map: std::ptr::null(),
    }))
}

/// A 16-byte object with no reference fields.
fn leaf_descriptor() -> *mut TypeDescriptor {
    descriptor(1, 16, vec![-1])
}

/// A 16-byte object whose single field is a reference.
fn node_descriptor() -> *mut TypeDescriptor {
    descriptor(2, 16, vec![0, -1])
}

fn allocate_object(heap: &mut Heap, rtti: *mut TypeDescriptor) -> usize {
    let size = unsafe { (*rtti).size } as usize;
    let address = heap.allocate(size).expect("allocation failed");

    unsafe { *(address as *mut *mut TypeDescriptor) = rtti };

    address
}

fn allocate_array(heap: &mut Heap, rtti: *mut TypeDescriptor, length: usize) -> usize {
    let size = greyline::util::round_to_next_multiple(16 + length * 8, 16);
    let address = heap.allocate(size).expect("array allocation failed");

    unsafe {
        *(address as *mut *mut TypeDescriptor) = rtti;
        *((address + 8) as *mut usize) = length;
    }

    address
}

fn set_field(object: usize, index: usize, value: usize) {
    unsafe { *((object as *mut usize).add(1 + index)) = value };
}

fn set_element(array: usize, index: usize, value: usize) {
    unsafe { *((array as *mut usize).add(2 + index)) = value };
}

#[test]
fn test_fresh_allocations_share_a_young_block() {
    // S1: ten 16-byte objects in a fresh heap.
    let mut t = TestHeap::new(test_config());
    let leaf = leaf_descriptor();

    let objects: Vec<usize> = (0..10)
        .map(|_| allocate_object(&mut t.heap, leaf))
        .collect();

    for &object in &objects {
        assert!(t.heap.object_meta_for(object).is_allocated());
    }

    let block = t.heap.block_meta_for(objects[0]);

    for &object in &objects {
        assert_eq!(t.heap.block_meta_for(object), block);
    }

    assert!(!block.is_old(t.heap.config.max_young_age));
    assert!(!block.is_marked());
    assert_eq!(block.age(), 0);
}

#[test]
fn test_young_collection_keeps_only_rooted_objects() {
    // S2: root only object #5; everything else in the block dies.
    let mut t = TestHeap::new(test_config());
    let leaf = leaf_descriptor();

    let objects: Vec<usize> = (0..10)
        .map(|_| allocate_object(&mut t.heap, leaf))
        .collect();

    t.root(0, objects[5]);
    t.heap.collect_young();

    for (index, &object) in objects.iter().enumerate() {
        let meta = t.heap.object_meta_for(object);

        if index == 5 {
            assert!(meta.is_allocated(), "the survivor is allocated after sweep");
        } else {
            assert!(meta.is_free(), "object {} should have died", index);
        }
    }

    let block = t.heap.block_meta_for(objects[5]);

    assert!(!block.is_marked());
    assert!(!block.is_old(t.heap.config.max_young_age));
    assert_eq!(block.age(), 1);
}

#[test]
fn test_surviving_to_max_age_promotes_the_block() {
    // S3: two young collections with everything rooted promote the block.
    let mut t = TestHeap::new(test_config());
    let leaf = leaf_descriptor();

    let objects: Vec<usize> = (0..10)
        .map(|_| allocate_object(&mut t.heap, leaf))
        .collect();

    for (index, &object) in objects.iter().enumerate() {
        t.root(index, object);
    }

    t.heap.collect_young();
    t.heap.collect_young();

    let block = t.heap.block_meta_for(objects[0]);

    assert_eq!(block.age(), 2);
    assert!(block.is_old(t.heap.config.max_young_age));

    for &object in &objects {
        assert!(
            t.heap.object_meta_for(object).is_marked(),
            "old survivors carry the marked polarity"
        );
    }
}

#[test]
fn test_large_array_tracing_splits_into_refranges() {
    // S4: a 4096-element object array is traced in 16 batches of 256.
    let mut t = TestHeap::new(test_config());
    let leaf = leaf_descriptor();
    let array_rtti = array_descriptor();

    let array = allocate_array(&mut t.heap, array_rtti, 4096);
    let survivor = allocate_object(&mut t.heap, leaf);
    let casualty = allocate_object(&mut t.heap, leaf);

    set_element(array, 7, survivor);
    t.root(0, array);

    t.heap.collect_young();

    assert_eq!(t.heap.mark.refrange_packets.load(Ordering::Relaxed), 16);
    assert!(t.heap.object_meta_for(array).is_allocated());
    assert!(t.heap.object_meta_for(survivor).is_allocated());
    assert!(t.heap.object_meta_for(casualty).is_free());
}

#[test]
fn test_young_to_old_pointers_enter_the_remembered_set() {
    // S5: a young object pointing at an old object lands in the young
    // remembered set; dropping the pointer graduates it back out.
    let mut t = TestHeap::new(Config {
        pretenure: true,
        ..test_config()
    });
    let node = node_descriptor();

    let old = t.heap.allocate_pretenured(16).expect("pretenured allocation");
    unsafe { *(old as *mut *mut TypeDescriptor) = leaf_descriptor() };

    assert!(t.heap.object_meta_for(old).is_marked());
    assert!(t
        .heap
        .block_meta_for(old)
        .is_old(t.heap.config.max_young_age));

    let young = allocate_object(&mut t.heap, node);

    set_field(young, 0, old);
    t.root(0, young);

    t.heap.collect_young();

    assert!(t.heap.object_meta_for(young).is_remembered());
    assert_eq!(t.heap.mark.remembered_young_len(), 1);

    set_field(young, 0, 0);
    t.heap.collect_young();

    assert!(!t.heap.object_meta_for(young).is_remembered());
}

#[test]
fn test_dead_superblock_returns_every_block() {
    // S6: a 72 KiB object spans a 3-block superblock; once unreachable,
    // all three blocks go back to the block allocator.
    let mut t = TestHeap::new(test_config());
    let array_rtti = array_descriptor();

    let free_before = t.heap.block_allocator.free_blocks();
    let array = allocate_array(&mut t.heap, array_rtti, (72 * 1024 - 16) / 8);

    let head = t.heap.block_meta_for(array);

    assert_eq!(head.flag(), FLAG_SUPERBLOCK_START);
    assert_eq!(head.superblock_size(), 3);
    assert_eq!(head.add(1).flag(), FLAG_SUPERBLOCK_TAIL);
    assert_eq!(head.add(2).flag(), FLAG_SUPERBLOCK_TAIL);
    assert_eq!(t.heap.block_allocator.free_blocks(), free_before - 3);

    t.heap.collect_young();

    // The allocator's cursor churn nets out: the three superblock blocks
    // are the only permanent loss, and they came back.
    assert_eq!(t.heap.block_allocator.free_blocks(), free_before);

    let committed = t.heap.block_allocator.limit.load(Ordering::Relaxed) as usize;

    for index in 0..committed {
        let flag = t.heap.block_meta_at(index).flag();

        assert_ne!(flag, FLAG_SUPERBLOCK_START);
        assert_ne!(flag, FLAG_SUPERBLOCK_TAIL);
    }
}

#[test]
fn test_remembered_old_object_keeps_young_target_alive() {
    // The write barrier files an old object; the next young collection
    // seeds from it and keeps its young target alive.
    let mut t = TestHeap::new(Config {
        pretenure: true,
        ..test_config()
    });
    let node = node_descriptor();
    let leaf = leaf_descriptor();

    let old = t.heap.allocate_pretenured(16).expect("pretenured allocation");
    unsafe { *(old as *mut *mut TypeDescriptor) = node };

    let young = allocate_object(&mut t.heap, leaf);

    set_field(old, 0, young);
    t.heap.remember(Ptr::from_pointer(old as *mut Object));

    assert!(t.heap.object_meta_for(old).is_remembered());
    assert_eq!(t.heap.mark.remembered_old_len(), 1);

    t.heap.collect_young();

    assert!(
        t.heap.object_meta_for(young).is_allocated(),
        "the remembered set kept the young object alive"
    );
    assert!(
        t.heap.object_meta_for(old).is_remembered(),
        "the old object still holds a young pointer and stays remembered"
    );
}

#[test]
fn test_cycles_do_not_hang_the_marker() {
    let mut t = TestHeap::new(test_config());
    let node = node_descriptor();

    let a = allocate_object(&mut t.heap, node);
    let b = allocate_object(&mut t.heap, node);

    set_field(a, 0, b);
    set_field(b, 0, a);
    t.root(0, a);

    t.heap.collect_young();

    assert!(t.heap.object_meta_for(a).is_allocated());
    assert!(t.heap.object_meta_for(b).is_allocated());
}

#[test]
fn test_collection_leaves_the_packet_pool_quiescent() {
    let mut t = TestHeap::new(test_config());
    let node = node_descriptor();

    let mut previous = 0;

    for slot in 0..MODULE_SLOTS {
        let object = allocate_object(&mut t.heap, node);

        set_field(object, 0, previous);
        t.root(slot, object);
        previous = object;
    }

    t.heap.collect_young();

    assert!(t.heap.mark.is_mark_done());

    let parked = t.heap.mark.remembered_old.len() + t.heap.mark.remembered_young.len() + 2;

    assert_eq!(t.heap.mark.empty.len(), t.heap.mark.total - parked);
}

#[test]
fn test_consecutive_old_collections_are_idempotent() {
    let mut t = TestHeap::new(Config {
        pretenure: true,
        ..test_config()
    });
    let node = node_descriptor();

    let a = t.heap.allocate_pretenured(16).expect("pretenured allocation");
    unsafe { *(a as *mut *mut TypeDescriptor) = node };
    let b = t.heap.allocate_pretenured(16).expect("pretenured allocation");
    unsafe { *(b as *mut *mut TypeDescriptor) = leaf_descriptor() };

    set_field(a, 0, b);
    t.root(0, a);

    t.heap.collect_old();

    let meta_a = t.heap.object_meta_for(a).value();
    let meta_b = t.heap.object_meta_for(b).value();
    let age = t.heap.block_meta_for(a).age();

    t.heap.collect_old();

    assert_eq!(t.heap.object_meta_for(a).value(), meta_a);
    assert_eq!(t.heap.object_meta_for(b).value(), meta_b);
    assert_eq!(t.heap.block_meta_for(a).age(), age);
}

#[test]
fn test_old_collection_reclaims_unreachable_old_objects() {
    let mut t = TestHeap::new(Config {
        pretenure: true,
        ..test_config()
    });
    let leaf = leaf_descriptor();

    let kept = t.heap.allocate_pretenured(16).expect("pretenured allocation");
    unsafe { *(kept as *mut *mut TypeDescriptor) = leaf };
    let dropped = t.heap.allocate_pretenured(16).expect("pretenured allocation");
    unsafe { *(dropped as *mut *mut TypeDescriptor) = leaf };

    t.root(0, kept);

    t.heap.collect_old();

    assert!(t.heap.object_meta_for(kept).is_marked());
    assert!(t.heap.object_meta_for(dropped).is_free());
}

#[test]
fn test_remembered_set_overflows_into_parked_packets() {
    // More remembered objects than one packet holds: the heads overflow
    // onto the remembered lists and survive the collection.
    let mut t = TestHeap::new(Config {
        pretenure: true,
        ..test_config()
    });
    let node = node_descriptor();
    let leaf = leaf_descriptor();

    let young_target = allocate_object(&mut t.heap, leaf);
    t.root(0, young_target);

    let count = GREY_PACKET_ITEMS + 10;

    for _ in 0..count {
        let old = t.heap.allocate_pretenured(16).expect("pretenured allocation");

        unsafe { *(old as *mut *mut TypeDescriptor) = node };
        set_field(old, 0, young_target);
        t.heap.remember(Ptr::from_pointer(old as *mut Object));
    }

    assert_eq!(t.heap.mark.remembered_old_len(), count);
    assert_eq!(t.heap.mark.remembered_old.len(), 1);

    t.heap.collect_young();

    assert!(t.heap.object_meta_for(young_target).is_allocated());
    assert_eq!(
        t.heap.mark.remembered_old_len(),
        count,
        "every old object still points young and is re-remembered"
    );
}

#[test]
fn test_blocks_never_revert_from_old_to_young() {
    let mut t = TestHeap::new(test_config());
    let leaf = leaf_descriptor();

    let object = allocate_object(&mut t.heap, leaf);
    t.root(0, object);

    let block = t.heap.block_meta_for(object);
    let max_age = t.heap.config.max_young_age;

    t.heap.collect_young();
    assert_eq!(block.age(), 1);

    t.heap.collect_young();
    assert_eq!(block.age(), 2);
    assert!(block.is_old(max_age));

    // Further collections of either generation leave the age alone.
    t.heap.collect_young();
    t.heap.collect_old();

    assert!(block.is_old(max_age));
    assert_eq!(block.age(), 2);
    assert_ne!(block.flag(), FLAG_FREE);
}
