//! Per-block metadata records.
//!
//! A block's record carries its state tag, a mark bit, the age counter
//! that drives promotion, the first free line left behind by the sweeper,
//! and the superblock size when the block heads a large-object superblock.
//! Tail blocks of a superblock are reachable only through their head.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

pub const FLAG_FREE: u8 = 0x0;
pub const FLAG_RECYCLABLE: u8 = 0x1;
pub const FLAG_UNAVAILABLE: u8 = 0x2;
pub const FLAG_SUPERBLOCK_START: u8 = 0x3;
pub const FLAG_SUPERBLOCK_TAIL: u8 = 0x4;

/// Sentinel for "no free line recorded".
pub const LAST_HOLE: u16 = u16::MAX;

#[repr(C)]
pub struct BlockMeta {
    flag: AtomicU8,
    mark: AtomicU8,
    age: AtomicU8,
    first_free_line: AtomicU16,
    superblock_size: AtomicU32,
}

impl BlockMeta {
    #[inline(always)]
    pub fn flag(&self) -> u8 {
        self.flag.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_flag(&self, flag: u8) {
        self.flag.store(flag, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.flag() == FLAG_FREE
    }

    #[inline(always)]
    pub fn is_superblock_start(&self) -> bool {
        self.flag() == FLAG_SUPERBLOCK_START
    }

    #[inline(always)]
    pub fn is_superblock_tail(&self) -> bool {
        self.flag() == FLAG_SUPERBLOCK_TAIL
    }

    /// Whether the block belongs to the large allocator, either as a
    /// superblock head or one of its tails.
    #[inline(always)]
    pub fn contains_large_objects(&self) -> bool {
        self.is_superblock_start() || self.is_superblock_tail()
    }

    /// Marks the block. Racing markers of objects sharing the block make
    /// this an atomic OR rather than a plain store.
    #[inline(always)]
    pub fn mark(&self) {
        self.mark.fetch_or(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn unmark(&self) {
        self.mark.store(0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Relaxed) != 0
    }

    #[inline(always)]
    pub fn age(&self) -> u8 {
        self.age.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn increment_age(&self) {
        self.age.fetch_add(1, Ordering::Relaxed);
    }

    /// A block is old once its age has reached the promotion threshold.
    /// Age only ever increases, so an old block never reverts to young.
    #[inline(always)]
    pub fn is_old(&self, max_young_age: u8) -> bool {
        self.age() >= max_young_age
    }

    /// Flags the block as old from birth (pretenured allocation).
    #[inline(always)]
    pub fn set_old(&self, max_young_age: u8) {
        self.age.store(max_young_age, Ordering::Relaxed);
    }

    /// Whether the block will be old once the current collection
    /// finishes: it either is old already, or this collection promotes it.
    #[inline(always)]
    pub fn will_be_old(&self, max_young_age: u8) -> bool {
        self.age() >= max_young_age - 1
    }

    #[inline(always)]
    pub fn first_free_line(&self) -> u16 {
        self.first_free_line.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_first_free_line(&self, line: u16) {
        self.first_free_line.store(line, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn superblock_size(&self) -> u32 {
        self.superblock_size.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_superblock_size(&self, size: u32) {
        self.superblock_size.store(size, Ordering::Relaxed);
    }

    /// Resets the record to the free state.
    pub fn clear(&self) {
        self.flag.store(FLAG_FREE, Ordering::Relaxed);
        self.mark.store(0, Ordering::Relaxed);
        self.age.store(0, Ordering::Relaxed);
        self.first_free_line.store(LAST_HOLE, Ordering::Relaxed);
        self.superblock_size.store(0, Ordering::Relaxed);
    }
}
