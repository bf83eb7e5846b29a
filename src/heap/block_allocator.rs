//! The block allocator: owner of the pool of free blocks.
//!
//! Hands out single blocks to the bump allocators and contiguous
//! superblocks to the large allocator, and takes released blocks back
//! from the sweeper. Multiple sweeper threads release blocks
//! concurrently, so the lists are behind mutexes; the counters are plain
//! atomics so the allocation fast paths can read them without locking.

use crate::heap::Geometry;
use crate::meta::block_meta::{BlockMeta, FLAG_SUPERBLOCK_START, FLAG_SUPERBLOCK_TAIL, FLAG_UNAVAILABLE, LAST_HOLE};
use crate::util::ptr::Ptr;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct BlockAllocator {
    geometry: Geometry,

    /// Indices of free blocks, in LIFO order.
    free: Mutex<Vec<u32>>,

    /// Young blocks the sweeper found holes in, ready for reuse by the
    /// bump allocator.
    recyclable: Mutex<Vec<u32>>,

    pub free_block_count: AtomicU32,
    pub young_block_count: AtomicU32,
    pub old_block_count: AtomicU32,

    /// The number of committed blocks; indices beyond this are reserved
    /// address space the heap has not grown into yet.
    pub limit: AtomicU32,
}

impl BlockAllocator {
    pub fn new(geometry: Geometry, committed: u32) -> Self {
        let allocator = BlockAllocator {
            geometry,
            free: Mutex::new(Vec::with_capacity(committed as usize)),
            recyclable: Mutex::new(Vec::new()),
            free_block_count: AtomicU32::new(0),
            young_block_count: AtomicU32::new(0),
            old_block_count: AtomicU32::new(0),
            limit: AtomicU32::new(0),
        };

        allocator.commit_blocks(0, committed);
        allocator
    }

    /// Makes the blocks `[from, to)` available, clearing their records.
    /// Pushed in reverse so they are handed out in ascending address
    /// order.
    pub fn commit_blocks(&self, from: u32, to: u32) {
        let mut free = self.free.lock();

        for index in (from..to).rev() {
            self.geometry.block_meta_at(index as usize).clear();
            free.push(index);
        }

        self.free_block_count.fetch_add(to - from, Ordering::Relaxed);
        self.limit.store(to, Ordering::Relaxed);
    }

    /// Pops a free block, flags it unavailable and returns its record.
    pub fn get_free_block(&self) -> Option<Ptr<BlockMeta>> {
        let index = self.free.lock().pop()?;

        self.free_block_count.fetch_sub(1, Ordering::Relaxed);

        let block = self.geometry.block_meta_at(index as usize);

        debug_assert!(block.is_free());
        debug_assert_eq!(block.age(), 0);

        block.set_flag(FLAG_UNAVAILABLE);
        block.set_first_free_line(LAST_HOLE);

        Some(block)
    }

    /// Finds `size` contiguous free blocks and returns the head of the
    /// resulting superblock, with the tail blocks flagged as such.
    pub fn get_free_superblock(&self, size: u32) -> Option<Ptr<BlockMeta>> {
        debug_assert!(size >= 1);

        let mut free = self.free.lock();

        free.sort_unstable();

        let mut run_start = 0;

        for position in 0..free.len() {
            if position > 0 && free[position] != free[position - 1] + 1 {
                run_start = position;
            }

            if position - run_start + 1 == size as usize {
                let head_index = free[run_start];

                free.drain(run_start..=position);
                self.free_block_count.fetch_sub(size, Ordering::Relaxed);

                let head = self.geometry.block_meta_at(head_index as usize);

                head.set_flag(FLAG_SUPERBLOCK_START);
                head.set_superblock_size(size);

                for tail in 1..size as usize {
                    head.add(tail).set_flag(FLAG_SUPERBLOCK_TAIL);
                }

                return Some(head);
            }
        }

        None
    }

    /// Releases `count` contiguous blocks starting at `head` back into
    /// the free pool. Their object metadata is wiped here: the old sweep
    /// leaves remembered bits on dead bytes, and a reused block must not
    /// inherit them.
    pub fn add_free_blocks(&self, head: Ptr<BlockMeta>, count: u32) {
        let head_index = self.geometry.block_index(head) as u32;
        let mut free = self.free.lock();

        for index in head_index..head_index + count {
            self.geometry.block_meta_at(index as usize).clear();
            self.geometry
                .object_meta_for(self.geometry.block_start(index as usize))
                .clear_block();
            free.push(index);
        }

        self.free_block_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_recyclable_block(&self, block: Ptr<BlockMeta>) {
        let index = self.geometry.block_index(block) as u32;

        self.recyclable.lock().push(index);
    }

    /// Pops a block with holes for the bump allocator to refill from.
    /// The block was already counted as young when it survived the sweep.
    pub fn get_recyclable_block(&self) -> Option<Ptr<BlockMeta>> {
        let index = self.recyclable.lock().pop()?;
        let block = self.geometry.block_meta_at(index as usize);

        block.set_flag(FLAG_UNAVAILABLE);

        Some(block)
    }

    /// Forgets the recyclable blocks. Called when a collection starts:
    /// the sweep rebuilds the list, and a block freed wholesale must not
    /// linger on it.
    pub fn clear_recyclable(&self) {
        self.recyclable.lock().clear();
    }

    pub fn young_blocks(&self) -> u32 {
        self.young_block_count.load(Ordering::Relaxed)
    }

    pub fn old_blocks(&self) -> u32 {
        self.old_block_count.load(Ordering::Relaxed)
    }

    pub fn free_blocks(&self) -> u32 {
        self.free_block_count.load(Ordering::Relaxed)
    }

    /// Whether enough free blocks remain to re-initialise the bump
    /// allocation cursors after a collection.
    pub fn can_init_cursors(&self, pretenure: bool) -> bool {
        self.free_blocks() >= if pretenure { 3 } else { 2 }
    }
}
