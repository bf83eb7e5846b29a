//! The large-object allocator.
//!
//! Objects of at least `LARGE_OBJECT_MIN` bytes live in chunks spanning
//! one or more blocks. Chunks smaller than a block come from size-bucketed
//! free lists; anything bigger claims a fresh superblock from the block
//! allocator. Free chunk heads are flagged `PLACEHOLDER` in the object
//! metadata so the conservative scan cannot mistake them for objects.

use crate::config::{BLOCK_SIZE, FREE_LIST_COUNT, MIN_CHUNK_SIZE};
use crate::heap::block_allocator::BlockAllocator;
use crate::heap::{Geometry, Heap};
use crate::meta::block_meta::{BlockMeta, FLAG_SUPERBLOCK_START};
use crate::meta::object_meta;
use crate::util::ptr::Ptr;
use crate::util::{div_and_round_up, round_to_next_multiple};
use crate::Word;
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::Ordering;

/// Overlay for the head of a free chunk. The first word shadows the
/// descriptor slot of the object that used to live here.
#[repr(C)]
pub struct Chunk {
    pub nothing: *mut Word,
    pub size: usize,
    pub next: Ptr<Chunk>,
}

#[derive(Copy, Clone)]
struct FreeList {
    first: Ptr<Chunk>,
    last: Ptr<Chunk>,
}

impl FreeList {
    fn new() -> Self {
        FreeList {
            first: Ptr::null(),
            last: Ptr::null(),
        }
    }

    fn push_last(&mut self, mut chunk: Ptr<Chunk>) {
        chunk.next = Ptr::null();

        if self.first.is_null() {
            self.first = chunk;
        } else {
            self.last.get().next = chunk;
        }

        self.last = chunk;
    }

    fn pop_first(&mut self) -> Ptr<Chunk> {
        let chunk = self.first;

        if chunk.is_null() {
            return chunk;
        }

        if self.first == self.last {
            self.last = Ptr::null();
        }

        self.first = chunk.next;

        chunk
    }
}

fn bucket_for(size: usize) -> usize {
    debug_assert!(size >= MIN_CHUNK_SIZE);
    debug_assert!(size % MIN_CHUNK_SIZE == 0);

    let index = size / MIN_CHUNK_SIZE - 1;

    debug_assert!(index < FREE_LIST_COUNT);

    index
}

pub struct LargeAllocator {
    geometry: Geometry,
    max_young_age: u8,
    pretenure: bool,
    free_lists: Mutex<[FreeList; FREE_LIST_COUNT]>,
}

unsafe impl Send for LargeAllocator {}
unsafe impl Sync for LargeAllocator {}

impl LargeAllocator {
    pub fn new(geometry: Geometry, max_young_age: u8, pretenure: bool) -> Self {
        LargeAllocator {
            geometry,
            max_young_age,
            pretenure,
            free_lists: Mutex::new([FreeList::new(); FREE_LIST_COUNT]),
        }
    }

    /// Adds a free chunk to the bucket for its size.
    pub fn add_chunk(&self, mut chunk: Ptr<Chunk>, total_size: usize) {
        debug_assert!(total_size >= MIN_CHUNK_SIZE);
        debug_assert!(total_size < BLOCK_SIZE);
        debug_assert!(total_size % MIN_CHUNK_SIZE == 0);

        chunk.nothing = ptr::null_mut();
        chunk.size = total_size;

        self.geometry
            .object_meta_for(chunk.0 as usize)
            .set_placeholder();

        self.free_lists.lock()[bucket_for(total_size)].push_last(chunk);
    }

    fn get_chunk(&self, required_size: usize) -> Ptr<Chunk> {
        let mut lists = self.free_lists.lock();

        for bucket in bucket_for(required_size)..FREE_LIST_COUNT {
            let chunk = lists[bucket].pop_first();

            if !chunk.is_null() {
                return chunk;
            }
        }

        Ptr::null()
    }

    /// Allocates a zeroed chunk of at least `requested_size` bytes.
    pub fn alloc(&self, blocks: &BlockAllocator, requested_size: usize) -> Option<usize> {
        let actual_size = round_to_next_multiple(requested_size, MIN_CHUNK_SIZE);

        let mut chunk = Ptr::null();

        if actual_size < BLOCK_SIZE {
            // Only chunks smaller than a block live in the free lists.
            chunk = self.get_chunk(actual_size);
        }

        if chunk.is_null() {
            let superblock_size = div_and_round_up(actual_size, BLOCK_SIZE) as u32;
            let superblock = blocks.get_free_superblock(superblock_size)?;

            debug_assert_eq!(superblock.age(), 0);

            if self.pretenure {
                // Every block holding old objects must itself be old.
                let last = superblock.add(superblock_size as usize - 1);

                superblock.set_old(self.max_young_age);

                if superblock_size > 1 {
                    last.set_old(self.max_young_age);
                }

                blocks
                    .old_block_count
                    .fetch_add(superblock_size, Ordering::Relaxed);
            } else {
                blocks
                    .young_block_count
                    .fetch_add(superblock_size, Ordering::Relaxed);
            }

            let start = self
                .geometry
                .block_start(self.geometry.block_index(superblock));

            chunk = Ptr::from_pointer(start as *mut Chunk);
            chunk.get().nothing = ptr::null_mut();
            chunk.get().size = superblock_size as usize * BLOCK_SIZE;
        }

        let chunk_size = chunk.size;

        debug_assert!(chunk_size >= MIN_CHUNK_SIZE);

        if chunk_size - actual_size >= MIN_CHUNK_SIZE {
            let remainder = Ptr::from_pointer((chunk.0 as usize + actual_size) as *mut Chunk);

            self.add_chunk(remainder, chunk_size - actual_size);
        }

        let meta = self.geometry.object_meta_for(chunk.0 as usize);

        debug_assert!(!meta.is_remembered());

        if self.pretenure {
            meta.set_marked();
        } else {
            meta.set_allocated();
        }

        unsafe { ptr::write_bytes(chunk.0 as *mut u8, 0, actual_size) };

        Some(chunk.0 as usize)
    }

    /// Drops every free list. Called before a sweep; split remainders
    /// repopulate the lists as allocation resumes.
    pub fn clear(&self) {
        let mut lists = self.free_lists.lock();

        for list in lists.iter_mut() {
            *list = FreeList::new();
        }
    }

    /// Sweeps one superblock.
    ///
    /// Large objects are always allocated at the start of the smallest
    /// superblock that fits, with trailing gaps refilled by chunks
    /// smaller than a block. Chunks can therefore only start at the head
    /// block or inside the last block, and the sweep inspects just those
    /// candidate offsets. The constituent blocks are reclaimed
    /// independently: a dead head releases every block but the tail, and
    /// a tail without live chunks goes too.
    pub fn sweep_superblock(&self, heap: &Heap, block: Ptr<BlockMeta>, collecting_old: bool) {
        let head_old = block.is_old(self.max_young_age);

        // The opposite generation is left untouched, exactly like small
        // blocks.
        if collecting_old != head_old {
            return;
        }

        let blocks = &heap.block_allocator;
        let superblock_size = block.superblock_size();
        let head_index = self.geometry.block_index(block);
        let block_start = self.geometry.block_start(head_index);
        let block_end = block_start + superblock_size as usize * BLOCK_SIZE;
        let last = block.add(superblock_size as usize - 1);

        if !collecting_old {
            debug_assert!(!block.is_old(self.max_young_age));
            block.increment_age();

            if superblock_size > 1 {
                last.increment_age();
            }

            debug_assert_eq!(block.age(), last.age());
        }

        let now_old = block.is_old(self.max_young_age);
        let first_meta = self.geometry.object_meta_for(block_start);
        let first_alive = first_meta.is_alive_sweep(collecting_old);

        if superblock_size > 1 && !first_alive {
            // The big object is dead; release everything except the last
            // block, which may hold separately allocated chunks.
            blocks.add_free_blocks(block, superblock_size - 1);

            last.set_flag(FLAG_SUPERBLOCK_START);
            last.set_superblock_size(1);
        }

        let sweep_byte: fn(object_meta::ObjectMeta) = if collecting_old {
            object_meta::sweep_old_byte
        } else if now_old {
            object_meta::sweep_new_old_byte
        } else {
            object_meta::sweep_young_byte
        };

        sweep_byte(first_meta);

        let live_bit = if collecting_old { 0x2 } else { 0x4 };
        let last_block_start = block_end - BLOCK_SIZE;
        let mut current = last_block_start + MIN_CHUNK_SIZE;
        let mut contains_live = first_alive;

        while current < block_end {
            let meta = self.geometry.object_meta_for(current);

            if !contains_live {
                contains_live = meta.value() & live_bit != 0;
            }

            sweep_byte(meta);
            current += MIN_CHUNK_SIZE;
        }

        if !contains_live {
            // No chunk in the last block survived either; if the head was
            // alive it would necessarily extend into this block.
            blocks.add_free_blocks(last, 1);
            return;
        }

        // Account the surviving blocks under the recounted generation.
        let survivors = if first_alive { superblock_size } else { 1 };

        if collecting_old || now_old {
            blocks.old_block_count.fetch_add(survivors, Ordering::Relaxed);
        } else {
            blocks
                .young_block_count
                .fetch_add(survivors, Ordering::Relaxed);
        }
    }
}
