//! The bump-pointer allocator for small objects.
//!
//! Three cursor/limit pairs: normal young allocation, pretenured
//! allocation into blocks that are old from birth, and overflow
//! allocation for objects too big for the current hole. The young cursor
//! refills first from recyclable blocks, scanning their line metadata for
//! the next hole, then from free blocks; the overflow and pretenured
//! cursors use whole free blocks only.

use crate::config::{BLOCK_SIZE, LINE_COUNT, LINE_SIZE};
use crate::heap::block_allocator::BlockAllocator;
use crate::heap::Geometry;
use crate::meta::block_meta::{BlockMeta, LAST_HOLE};
use crate::util::ptr::Ptr;
use std::ptr;
use std::sync::atomic::Ordering;

pub struct Allocator {
    geometry: Geometry,

    max_young_blocks: usize,
    max_young_age: u8,
    pretenure: bool,

    cursor: usize,
    limit: usize,
    block: Ptr<BlockMeta>,
    block_start: usize,

    /// The line to resume the hole scan from when the current block came
    /// off the recyclable list. `LINE_COUNT` means the block has no holes
    /// left to find.
    next_hole_line: usize,

    large_cursor: usize,
    large_limit: usize,
    large_block: Ptr<BlockMeta>,
    large_block_start: usize,

    pretenured_cursor: usize,
    pretenured_limit: usize,
    pretenured_block: Ptr<BlockMeta>,
    pretenured_block_start: usize,
}

impl Allocator {
    pub fn new(
        geometry: Geometry,
        max_young_blocks: usize,
        max_young_age: u8,
        pretenure: bool,
    ) -> Self {
        Allocator {
            geometry,
            max_young_blocks,
            max_young_age,
            pretenure,
            cursor: 0,
            limit: 0,
            block: Ptr::null(),
            block_start: 0,
            next_hole_line: LINE_COUNT,
            large_cursor: 0,
            large_limit: 0,
            large_block: Ptr::null(),
            large_block_start: 0,
            pretenured_cursor: 0,
            pretenured_limit: 0,
            pretenured_block: Ptr::null(),
            pretenured_block_start: 0,
        }
    }

    /// Points every cursor at a fresh block. Returns `false` when the
    /// block allocator cannot supply them; the cursors are left dead so
    /// subsequent allocations fail over to the collection ladder.
    pub fn init_cursors(&mut self, blocks: &BlockAllocator) -> bool {
        self.cursor = 0;
        self.limit = 0;
        self.large_cursor = 0;
        self.large_limit = 0;
        self.pretenured_cursor = 0;
        self.pretenured_limit = 0;

        if !self.new_block(blocks) {
            return false;
        }

        if self.pretenure && !self.new_pretenured_block(blocks) {
            return false;
        }

        match blocks.get_free_block() {
            Some(block) => {
                let start = self.geometry.block_start(self.geometry.block_index(block));

                self.large_block = block;
                self.large_block_start = start;
                self.large_cursor = start;
                self.large_limit = start + BLOCK_SIZE;
                blocks.young_block_count.fetch_add(1, Ordering::Relaxed);

                true
            }
            None => false,
        }
    }

    /// Allocation fast path. Returns the zeroed payload address, or
    /// `None` when a collection is needed first.
    pub fn alloc(&mut self, blocks: &BlockAllocator, size: usize) -> Option<usize> {
        let start = self.cursor;
        let end = start + size;

        if end > self.limit {
            // A medium object may simply not fit the remaining hole; give
            // it a bump range of its own instead of burning the hole.
            if size > LINE_SIZE {
                return self.overflow_alloc(blocks, size);
            }

            if self.advance_cursor(blocks) {
                return self.alloc(blocks, size);
            }

            return None;
        }

        unsafe { ptr::write_bytes(start as *mut u8, 0, size) };
        self.cursor = end;

        Some(start)
    }

    /// Overflow allocation uses free blocks only; recyclable holes are
    /// never large enough to be worth scanning for these sizes.
    fn overflow_alloc(&mut self, blocks: &BlockAllocator, size: usize) -> Option<usize> {
        let start = self.large_cursor;
        let end = start + size;

        if end > self.large_limit {
            if blocks.young_blocks() as usize >= self.max_young_blocks {
                return None;
            }

            let block = blocks.get_free_block()?;
            let block_start = self.geometry.block_start(self.geometry.block_index(block));

            blocks.young_block_count.fetch_add(1, Ordering::Relaxed);
            self.large_block = block;
            self.large_block_start = block_start;
            self.large_cursor = block_start;
            self.large_limit = block_start + BLOCK_SIZE;

            return self.overflow_alloc(blocks, size);
        }

        unsafe { ptr::write_bytes(start as *mut u8, 0, size) };
        self.large_cursor = end;

        Some(start)
    }

    /// Allocates into a block that is old from birth. The caller flags
    /// the object meta `MARKED`: the young tracer never revisits old
    /// allocations.
    pub fn alloc_pretenured(&mut self, blocks: &BlockAllocator, size: usize) -> Option<usize> {
        let start = self.pretenured_cursor;
        let end = start + size;

        if end > self.pretenured_limit {
            if self.new_pretenured_block(blocks) {
                return self.alloc_pretenured(blocks, size);
            }

            return None;
        }

        unsafe { ptr::write_bytes(start as *mut u8, 0, size) };
        self.pretenured_cursor = end;

        Some(start)
    }

    /// Moves the young cursor to the next usable range: the next hole of
    /// the current recyclable block, a freshly popped recyclable block,
    /// or a whole free block.
    fn advance_cursor(&mut self, blocks: &BlockAllocator) -> bool {
        if self.find_next_hole() {
            return true;
        }

        if let Some(block) = blocks.get_recyclable_block() {
            // Counted as young when it survived the sweep.
            self.block = block;
            self.block_start = self.geometry.block_start(self.geometry.block_index(block));
            self.next_hole_line = block.first_free_line() as usize;

            if self.find_next_hole() {
                return true;
            }
            // A recyclable block always records at least one hole; fall
            // through if the scan disagrees.
        }

        // Only a fresh block counts against the young budget.
        if blocks.young_blocks() as usize >= self.max_young_blocks {
            return false;
        }

        self.new_block(blocks)
    }

    /// Scans line metadata of the current block for the next run of
    /// empty lines and turns it into the bump range.
    fn find_next_hole(&mut self) -> bool {
        if self.next_hole_line >= LINE_COUNT || self.block.is_null() {
            return false;
        }

        let first_line = self.geometry.line_index(self.block_start);
        let mut line = self.next_hole_line;

        while line < LINE_COUNT && !self.geometry.line_meta_at(first_line + line).is_empty() {
            line += 1;
        }

        if line == LINE_COUNT {
            self.next_hole_line = LINE_COUNT;
            return false;
        }

        let hole_start = line;

        while line < LINE_COUNT && self.geometry.line_meta_at(first_line + line).is_empty() {
            line += 1;
        }

        self.cursor = self.block_start + hole_start * LINE_SIZE;
        self.limit = self.block_start + line * LINE_SIZE;
        self.next_hole_line = line;

        true
    }

    fn new_block(&mut self, blocks: &BlockAllocator) -> bool {
        let block = match blocks.get_free_block() {
            Some(block) => block,
            None => return false,
        };

        debug_assert_eq!(block.age(), 0);

        let block_start = self.geometry.block_start(self.geometry.block_index(block));

        self.cursor = block_start;
        self.limit = block_start + BLOCK_SIZE;
        block.set_first_free_line(LAST_HOLE);

        self.block = block;
        self.block_start = block_start;
        self.next_hole_line = LINE_COUNT;
        blocks.young_block_count.fetch_add(1, Ordering::Relaxed);

        true
    }

    fn new_pretenured_block(&mut self, blocks: &BlockAllocator) -> bool {
        let block = match blocks.get_free_block() {
            Some(block) => block,
            None => return false,
        };

        block.set_old(self.max_young_age);
        debug_assert!(block.is_old(self.max_young_age));

        let block_start = self.geometry.block_start(self.geometry.block_index(block));

        self.pretenured_cursor = block_start;
        self.pretenured_limit = block_start + BLOCK_SIZE;
        block.set_first_free_line(LAST_HOLE);

        self.pretenured_block = block;
        self.pretenured_block_start = block_start;
        blocks.old_block_count.fetch_add(1, Ordering::Relaxed);

        true
    }
}
