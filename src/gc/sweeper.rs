//! The striped parallel sweeper.
//!
//! Sweeper threads claim blocks through an atomic cursor over the block
//! metadata array. Dead blocks go back to the block allocator wholesale;
//! surviving young blocks age (and promote at the threshold) and have
//! their object metadata swept with the branch-free word operations; the
//! generation not being collected is left untouched. Superblocks are
//! handed to the large allocator, which reclaims their constituent
//! blocks independently.

use crate::config::{LINE_COUNT, METAS_PER_LINE};
use crate::heap::Heap;
use crate::meta::block_meta::{
    BlockMeta, FLAG_FREE, FLAG_RECYCLABLE, FLAG_SUPERBLOCK_START, FLAG_SUPERBLOCK_TAIL,
    FLAG_UNAVAILABLE, LAST_HOLE,
};
use crate::meta::object_meta::{
    sweep_line_at, sweep_new_old_word, sweep_old_word, sweep_young_word, ObjectMeta,
};
use crate::util::ptr::Ptr;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct SweepState {
    pub cursor: AtomicU32,
    pub limit: AtomicU32,
}

impl SweepState {
    pub fn new() -> Self {
        SweepState {
            cursor: AtomicU32::new(0),
            limit: AtomicU32::new(0),
        }
    }
}

/// Claims and sweeps blocks until the cursor runs past the committed
/// heap. Safe to run from any number of threads at once.
pub fn sweep(heap: &Heap, collecting_old: bool) {
    loop {
        let index = heap.sweep.cursor.fetch_add(1, Ordering::Relaxed);

        if index >= heap.sweep.limit.load(Ordering::Relaxed) {
            return;
        }

        sweep_block(heap, index as usize, collecting_old);
    }
}

fn sweep_block(heap: &Heap, index: usize, collecting_old: bool) {
    let block = heap.block_meta_at(index);

    match block.flag() {
        // Tails are reclaimed through their superblock head, whichever
        // sweeper claims it.
        FLAG_FREE | FLAG_SUPERBLOCK_TAIL => {}
        FLAG_SUPERBLOCK_START => {
            heap.large_allocator.sweep_superblock(heap, block, collecting_old)
        }
        _ => recycle_block(heap, block, index, collecting_old),
    }
}

/// Sweeps a small-object block in the generation being collected.
fn recycle_block(heap: &Heap, block: Ptr<BlockMeta>, index: usize, collecting_old: bool) {
    let max_age = heap.config.max_young_age;

    // The other generation was neither traced nor marked this cycle;
    // sweeping it would reclaim live objects.
    if collecting_old != block.is_old(max_age) {
        return;
    }

    if !block.is_marked() {
        // No live object anywhere in the block; the release wipes both
        // the block record and the object metadata.
        heap.block_allocator.add_free_blocks(block, 1);

        return;
    }

    block.unmark();

    if collecting_old {
        heap.block_allocator
            .old_block_count
            .fetch_add(1, Ordering::Relaxed);
        sweep_lines(heap, index, sweep_old_word);
        block.set_flag(FLAG_UNAVAILABLE);

        return;
    }

    block.increment_age();

    if block.is_old(max_age) {
        // Promoted by this collection; survivors keep the old-live
        // `MARKED` polarity.
        heap.block_allocator
            .old_block_count
            .fetch_add(1, Ordering::Relaxed);
        sweep_lines(heap, index, sweep_new_old_word);
        block.set_flag(FLAG_UNAVAILABLE);

        return;
    }

    heap.block_allocator
        .young_block_count
        .fetch_add(1, Ordering::Relaxed);

    let first_free = sweep_young_lines(heap, index);

    block.set_first_free_line(first_free);

    if first_free != LAST_HOLE {
        block.set_flag(FLAG_RECYCLABLE);
        heap.block_allocator.add_recyclable_block(block);
    } else {
        block.set_flag(FLAG_UNAVAILABLE);
    }
}

/// Sweeps every line's metadata with the given word operation and clears
/// the line marks consumed in the process.
fn sweep_lines(heap: &Heap, index: usize, sweep: fn(u64) -> u64) {
    let meta = heap.object_meta_for(heap.block_start(index));
    let first_line = heap.line_index(heap.block_start(index));

    for line in 0..LINE_COUNT {
        sweep_line_at(ObjectMeta(unsafe { meta.0.add(line * METAS_PER_LINE) }), sweep);
        heap.line_meta_at(first_line + line).unmark();
    }
}

/// The young sweep additionally rebuilds the hole information: unmarked
/// lines become empty, and the first of them is recorded so the bump
/// allocator knows where to resume. Returns `LAST_HOLE` for a fully
/// occupied block.
fn sweep_young_lines(heap: &Heap, index: usize) -> u16 {
    let meta = heap.object_meta_for(heap.block_start(index));
    let first_line = heap.line_index(heap.block_start(index));
    let mut first_free = LAST_HOLE;

    for line in 0..LINE_COUNT {
        sweep_line_at(
            ObjectMeta(unsafe { meta.0.add(line * METAS_PER_LINE) }),
            sweep_young_word,
        );

        let line_meta = heap.line_meta_at(first_line + line);

        if line_meta.is_marked() {
            line_meta.unmark();
            line_meta.clear_empty();
        } else {
            line_meta.set_empty();

            if first_free == LAST_HOLE {
                first_free = line as u16;
            }
        }
    }

    first_free
}
