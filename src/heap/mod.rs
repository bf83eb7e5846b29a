//! The heap: one contiguous run of blocks plus the side tables that
//! describe it, the allocators that carve it up and the collection
//! driver that reclaims it.
//!
//! All metadata is reached by shifting an address' offset from the heap
//! start: by the allocation alignment for object metadata, by the line
//! size for line metadata and by the block size for block records. No
//! indirection, and the mapping is bijective.

pub mod allocator;
pub mod block_allocator;
pub mod large_allocator;

use crate::config::{
    Config, ALLOCATION_ALIGNMENT, BLOCK_SIZE, LARGE_OBJECT_MIN, LINE_COUNT, LINE_SIZE,
    METAS_PER_BLOCK,
};
use crate::gc::pool::Pool;
use crate::gc::roots::Roots;
use crate::gc::sweeper::{self, SweepState};
use crate::gc::{marker, MarkState};
use crate::meta::block_meta::BlockMeta;
use crate::meta::line_meta::LineMeta;
use crate::meta::object_meta::ObjectMeta;
use crate::object::Object;
use crate::util::div_and_round_up;
use crate::util::ptr::Ptr;
use allocator::Allocator;
use block_allocator::BlockAllocator;
use large_allocator::LargeAllocator;
use log::{debug, trace};
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The allocation ladder ran out of options: collection freed too
/// little and the heap is already at its configured maximum.
#[derive(Debug, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "the heap is out of memory")
    }
}

impl std::error::Error for OutOfMemory {}

/// The heap start and metadata bases every component derives addresses
/// from. Copied into the allocators so they do not need the heap itself.
#[derive(Copy, Clone)]
pub struct Geometry {
    pub heap_start: usize,
    pub object_meta: *mut u8,
    pub line_meta: *mut u8,
    pub block_meta: *mut BlockMeta,
}

unsafe impl Send for Geometry {}
unsafe impl Sync for Geometry {}

impl Geometry {
    #[inline(always)]
    pub fn object_meta_for(&self, address: usize) -> ObjectMeta {
        debug_assert!(address >= self.heap_start);

        ObjectMeta(unsafe {
            self.object_meta
                .add((address - self.heap_start) / ALLOCATION_ALIGNMENT)
        })
    }

    #[inline(always)]
    pub fn line_index(&self, address: usize) -> usize {
        (address - self.heap_start) / LINE_SIZE
    }

    #[inline(always)]
    pub fn line_meta_at(&self, index: usize) -> LineMeta {
        LineMeta(unsafe { self.line_meta.add(index) })
    }

    #[inline(always)]
    pub fn block_meta_for(&self, address: usize) -> Ptr<BlockMeta> {
        self.block_meta_at((address - self.heap_start) / BLOCK_SIZE)
    }

    #[inline(always)]
    pub fn block_meta_at(&self, index: usize) -> Ptr<BlockMeta> {
        Ptr::from_pointer(unsafe { self.block_meta.add(index) })
    }

    #[inline(always)]
    pub fn block_index(&self, block: Ptr<BlockMeta>) -> usize {
        block.offset_from(Ptr::from_pointer(self.block_meta))
    }

    #[inline(always)]
    pub fn block_start(&self, index: usize) -> usize {
        self.heap_start + index * BLOCK_SIZE
    }

    #[inline(always)]
    pub fn block_start_for(&self, address: usize) -> usize {
        self.block_start((address - self.heap_start) / BLOCK_SIZE)
    }

    /// Resolves a superblock tail to the head block its record lives in.
    pub fn superblock_start(&self, block: Ptr<BlockMeta>) -> Ptr<BlockMeta> {
        let mut current = block;

        while current.is_superblock_tail() {
            current = self.block_meta_at(self.block_index(current) - 1);
        }

        current
    }
}

pub struct Heap {
    pub config: Config,
    geometry: Geometry,

    region: *mut u8,
    max_blocks: usize,
    heap_end: usize,

    pub block_allocator: BlockAllocator,
    pub allocator: Allocator,
    pub large_allocator: LargeAllocator,

    pub mark: MarkState,
    pub sweep: SweepState,
    pub roots: Roots,

    pool: Arc<Pool>,

    pub young_collections: AtomicUsize,
    pub old_collections: AtomicUsize,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

fn region_layout(max_blocks: usize) -> Layout {
    Layout::from_size_align(max_blocks * BLOCK_SIZE, BLOCK_SIZE).unwrap()
}

fn byte_table_layout(len: usize) -> Layout {
    Layout::from_size_align(len, mem::size_of::<u64>()).unwrap()
}

fn block_table_layout(max_blocks: usize) -> Layout {
    Layout::array::<BlockMeta>(max_blocks).unwrap()
}

impl Heap {
    /// Reserves the whole configured address range up front and commits
    /// the initial block count; `grow` raises the committed watermark.
    pub fn new(config: Config) -> Box<Heap> {
        config.verify();

        let max_blocks = div_and_round_up(config.max_heap_size, BLOCK_SIZE);
        let initial_blocks = div_and_round_up(config.initial_heap_size, BLOCK_SIZE);

        let region = unsafe { alloc(region_layout(max_blocks)) };
        let object_meta = unsafe { alloc_zeroed(byte_table_layout(max_blocks * METAS_PER_BLOCK)) };
        let line_meta = unsafe { alloc_zeroed(byte_table_layout(max_blocks * LINE_COUNT)) };
        let block_meta = unsafe { alloc_zeroed(block_table_layout(max_blocks)) } as *mut BlockMeta;

        assert!(
            !region.is_null() && !object_meta.is_null() && !line_meta.is_null()
                && !block_meta.is_null(),
            "failed to reserve the heap"
        );

        let geometry = Geometry {
            heap_start: region as usize,
            object_meta,
            line_meta,
            block_meta,
        };

        let block_allocator = BlockAllocator::new(geometry, initial_blocks as u32);
        let max_young_blocks = config
            .max_young_blocks
            .unwrap_or_else(|| (initial_blocks / 2).max(1));

        let allocator = Allocator::new(
            geometry,
            max_young_blocks,
            config.max_young_age,
            config.pretenure,
        );
        let large_allocator = LargeAllocator::new(geometry, config.max_young_age, config.pretenure);

        // Enough packets that the frontier of any realistic object graph
        // fits; the marker asserts if this heuristic is ever wrong.
        let total_packets = (max_blocks * 4).max(64).min(16384) as u32;
        let mark = MarkState::new(total_packets);

        let pool = Pool::new(config.worker_count());

        trace!(
            "heap initialised: {} committed blocks, {} max, {} grey packets, {} workers",
            initial_blocks,
            max_blocks,
            total_packets,
            pool.threads()
        );

        let mut heap = Box::new(Heap {
            config,
            geometry,
            region,
            max_blocks,
            heap_end: region as usize + initial_blocks * BLOCK_SIZE,
            block_allocator,
            allocator,
            large_allocator,
            mark,
            sweep: SweepState::new(),
            roots: Roots::default(),
            pool,
            young_collections: AtomicUsize::new(0),
            old_collections: AtomicUsize::new(0),
        });

        assert!(
            heap.block_allocator.can_init_cursors(heap.config.pretenure),
            "initial heap too small for the allocator"
        );

        let heap_mut = &mut *heap;
        let initialised = heap_mut.allocator.init_cursors(&heap_mut.block_allocator);

        assert!(initialised, "initial heap too small for the allocator");

        heap
    }

    /// Registers the runtime's root sources.
    pub fn set_roots(&mut self, roots: Roots) {
        self.roots = roots;
    }

    #[inline(always)]
    pub fn is_address_in_heap(&self, address: usize) -> bool {
        address >= self.geometry.heap_start && address < self.heap_end
    }

    #[inline(always)]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[inline(always)]
    pub fn object_meta_for(&self, address: usize) -> ObjectMeta {
        self.geometry.object_meta_for(address)
    }

    #[inline(always)]
    pub fn line_index(&self, address: usize) -> usize {
        self.geometry.line_index(address)
    }

    #[inline(always)]
    pub fn line_meta_at(&self, index: usize) -> LineMeta {
        self.geometry.line_meta_at(index)
    }

    #[inline(always)]
    pub fn block_meta_for(&self, address: usize) -> Ptr<BlockMeta> {
        self.geometry.block_meta_for(address)
    }

    #[inline(always)]
    pub fn block_meta_at(&self, index: usize) -> Ptr<BlockMeta> {
        self.geometry.block_meta_at(index)
    }

    #[inline(always)]
    pub fn block_index(&self, block: Ptr<BlockMeta>) -> usize {
        self.geometry.block_index(block)
    }

    #[inline(always)]
    pub fn block_start(&self, index: usize) -> usize {
        self.geometry.block_start(index)
    }

    #[inline(always)]
    pub fn block_start_for(&self, address: usize) -> usize {
        self.geometry.block_start_for(address)
    }

    #[inline(always)]
    pub fn superblock_start(&self, block: Ptr<BlockMeta>) -> Ptr<BlockMeta> {
        self.geometry.superblock_start(block)
    }

    /// Allocates `size` zeroed bytes. The first word is reserved for the
    /// descriptor pointer, which the runtime writes after this returns.
    pub fn allocate(&mut self, size: usize) -> Result<usize, OutOfMemory> {
        debug_assert!(size > 0 && size % ALLOCATION_ALIGNMENT == 0);

        if size >= LARGE_OBJECT_MIN {
            return self.allocate_large(size);
        }

        if let Some(address) = self.try_allocate_small(size) {
            return Ok(address);
        }

        self.collect_young();

        if let Some(address) = self.try_allocate_small(size) {
            return Ok(address);
        }

        self.collect_old();

        if let Some(address) = self.try_allocate_small(size) {
            return Ok(address);
        }

        if self.grow() {
            if let Some(address) = self.try_allocate_small(size) {
                return Ok(address);
            }
        }

        Err(OutOfMemory)
    }

    fn try_allocate_small(&mut self, size: usize) -> Option<usize> {
        let address = self.allocator.alloc(&self.block_allocator, size)?;

        self.geometry.object_meta_for(address).set_allocated();

        Some(address)
    }

    /// Allocates through the large allocator; one or more whole blocks.
    pub fn allocate_large(&mut self, size: usize) -> Result<usize, OutOfMemory> {
        debug_assert!(size > 0 && size % ALLOCATION_ALIGNMENT == 0);

        if let Some(address) = self.large_allocator.alloc(&self.block_allocator, size) {
            return Ok(address);
        }

        self.collect_young();

        if let Some(address) = self.large_allocator.alloc(&self.block_allocator, size) {
            return Ok(address);
        }

        self.collect_old();

        if let Some(address) = self.large_allocator.alloc(&self.block_allocator, size) {
            return Ok(address);
        }

        if self.grow() {
            if let Some(address) = self.large_allocator.alloc(&self.block_allocator, size) {
                return Ok(address);
            }
        }

        Err(OutOfMemory)
    }

    /// Allocates directly into an old block. The object meta is flagged
    /// `MARKED` because the young tracer never revisits old allocations.
    pub fn allocate_pretenured(&mut self, size: usize) -> Result<usize, OutOfMemory> {
        debug_assert!(size > 0 && size % ALLOCATION_ALIGNMENT == 0);

        if !self.config.pretenure {
            return self.allocate(size);
        }

        if size >= LARGE_OBJECT_MIN {
            // The large allocator pretenures on its own.
            return self.allocate_large(size);
        }

        if let Some(address) = self.try_allocate_pretenured(size) {
            return Ok(address);
        }

        self.collect_young();

        if let Some(address) = self.try_allocate_pretenured(size) {
            return Ok(address);
        }

        self.collect_old();

        if let Some(address) = self.try_allocate_pretenured(size) {
            return Ok(address);
        }

        if self.grow() {
            if let Some(address) = self.try_allocate_pretenured(size) {
                return Ok(address);
            }
        }

        Err(OutOfMemory)
    }

    fn try_allocate_pretenured(&mut self, size: usize) -> Option<usize> {
        let address = self.allocator.alloc_pretenured(&self.block_allocator, size)?;

        self.geometry.object_meta_for(address).set_marked();

        Some(address)
    }

    pub fn collect_young(&mut self) {
        self.collect(false);
    }

    pub fn collect_old(&mut self) {
        self.collect(true);
    }

    /// Runs one stop-the-world collection of the given generation:
    /// remembered-set seeding, root scan, parallel mark to quiescence,
    /// then the parallel sweep, and finally fresh allocation cursors.
    pub fn collect(&mut self, collecting_old: bool) {
        let started = std::time::Instant::now();

        trace!(
            "{} collection started",
            if collecting_old { "old" } else { "young" }
        );

        self.mark.reset_counters();
        self.block_allocator.clear_recyclable();

        self.mark.seed_from_remembered_set(collecting_old);
        marker::mark_roots(self, collecting_old);

        let heap_ptr: Ptr<Heap> = Ptr::from_pointer(self as *mut Heap);
        let pool = self.pool.clone();

        pool.scale_markers(heap_ptr, collecting_old, self.mark.full.len() as usize);
        marker::mark_until_done(self, collecting_old);
        pool.wait_idle();

        // The free lists refill from split remainders as allocation
        // resumes; stale chunks must not survive into the swept heap.
        self.large_allocator.clear();

        if collecting_old {
            self.block_allocator
                .old_block_count
                .store(0, Ordering::Relaxed);
        } else {
            self.block_allocator
                .young_block_count
                .store(0, Ordering::Relaxed);
        }

        self.sweep.cursor.store(0, Ordering::Relaxed);
        self.sweep
            .limit
            .store(self.block_allocator.limit.load(Ordering::Relaxed), Ordering::Relaxed);

        pool.start_sweep(heap_ptr, collecting_old);
        sweeper::sweep(self, collecting_old);
        pool.wait_idle();

        if !self.allocator.init_cursors(&self.block_allocator) {
            // Cursors are left dead; the allocation ladder escalates to
            // growth or out-of-memory.
            trace!("no free blocks left after collection");
        }

        if collecting_old {
            self.old_collections.fetch_add(1, Ordering::Relaxed);
        } else {
            self.young_collections.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            "{} collection done in {:?}: {} marked, {} young / {} old / {} free blocks",
            if collecting_old { "old" } else { "young" },
            started.elapsed(),
            self.mark.objects_marked.load(Ordering::Relaxed),
            self.block_allocator.young_blocks(),
            self.block_allocator.old_blocks(),
            self.block_allocator.free_blocks(),
        );
    }

    /// The mutator's store barrier: files an object holding a freshly
    /// written cross-generation pointer into the matching remembered set.
    pub fn remember(&self, object: Ptr<Object>) {
        let meta = self.object_meta_for(object.0 as usize);
        let mut block = self.block_meta_for(object.0 as usize);

        if block.contains_large_objects() {
            block = self.superblock_start(block);
        }

        if block.is_old(self.config.max_young_age) {
            if meta.try_set_remembered() {
                self.mark.remember_old_object(object);
            }
        } else if meta.try_set_remembered() {
            self.mark.remember_young_object(object);
        }
    }

    /// Commits more of the reserved range, halving the distance to the
    /// configured maximum. Returns whether anything was gained.
    pub fn grow(&mut self) -> bool {
        let committed = self.block_allocator.limit.load(Ordering::Relaxed) as usize;

        if committed >= self.max_blocks {
            return false;
        }

        let target = (committed + (committed / 2).max(1)).min(self.max_blocks);

        self.block_allocator
            .commit_blocks(committed as u32, target as u32);
        self.heap_end = self.geometry.heap_start + target * BLOCK_SIZE;

        trace!("heap grown from {} to {} blocks", committed, target);

        true
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.pool.shutdown();

        unsafe {
            dealloc(self.region, region_layout(self.max_blocks));
            dealloc(
                self.geometry.object_meta,
                byte_table_layout(self.max_blocks * METAS_PER_BLOCK),
            );
            dealloc(
                self.geometry.line_meta,
                byte_table_layout(self.max_blocks * LINE_COUNT),
            );
            dealloc(
                self.geometry.block_meta as *mut u8,
                block_table_layout(self.max_blocks),
            );
        }
    }
}
