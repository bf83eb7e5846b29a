//! The tracer's view of mutator objects.
//!
//! An object starts with a pointer to its runtime type descriptor. The
//! descriptor exposes everything the collector is allowed to know: a type
//! id, an "is array" discriminator, the object size and, for non-arrays,
//! the reference map (field indices, `-1` terminated). Object arrays
//! carry a length header followed by `length` word-wide fields.

use crate::config::{ALLOCATION_ALIGNMENT, MIN_CHUNK_SIZE, WORD_SIZE};
use crate::heap::Heap;
use crate::meta::object_meta::ObjectMeta;
use crate::util::ptr::Ptr;
use crate::util::round_to_next_multiple;
use crate::Word;
use std::mem;

pub const LAST_FIELD_OFFSET: i64 = -1;

#[repr(C)]
pub struct TypeDescriptor {
    /// The runtime's type id. Reference arrays are identified by
    /// comparing this against the id the runtime registers for them.
    pub id: i32,

    /// Total object size in bytes, already allocation aligned. Unused
    /// for arrays, whose size derives from the length header.
    pub size: u32,

    /// Arrays have no reference map; their layout is a length header
    /// followed by `length` fields.
    pub is_array: bool,

    /// Field indices holding strong references, terminated by
    /// `LAST_FIELD_OFFSET`. Null for arrays.
    pub ref_map: *const i64,
}

#[repr(C)]
pub struct Object {
    pub rtti: *mut TypeDescriptor,
}

#[repr(C)]
pub struct ArrayHeader {
    pub rtti: *mut TypeDescriptor,
    pub length: usize,
}

impl Ptr<Object> {
    #[inline(always)]
    pub fn rtti(&self) -> Ptr<TypeDescriptor> {
        Ptr::from_pointer(self.get().rtti)
    }

    #[inline(always)]
    pub fn is_array(&self) -> bool {
        self.rtti().is_array
    }

    #[inline(always)]
    pub fn as_array(&self) -> Ptr<ArrayHeader> {
        Ptr::from_pointer(self.0 as *mut ArrayHeader)
    }

    /// The object's size in bytes, recovered from the descriptor for
    /// regular objects and from the length header for arrays.
    pub fn size(&self) -> usize {
        if self.is_array() {
            round_to_next_multiple(
                mem::size_of::<ArrayHeader>() + self.as_array().length * WORD_SIZE,
                ALLOCATION_ALIGNMENT,
            )
        } else {
            self.rtti().size as usize
        }
    }

    /// The size of the large-allocator chunk holding this object.
    pub fn chunk_size(&self) -> usize {
        round_to_next_multiple(self.size(), MIN_CHUNK_SIZE)
    }

    /// Base of the field array of a regular object, directly after the
    /// descriptor pointer. Indexed by the descriptor's reference map.
    #[inline(always)]
    pub fn fields(&self) -> *mut *mut Word {
        unsafe { (self.0 as *mut *mut Word).add(1) }
    }

    /// Base of the field array of an object array, directly after the
    /// length header.
    #[inline(always)]
    pub fn array_fields(&self) -> *mut *mut Word {
        unsafe { (self.0 as *mut *mut Word).add(2) }
    }
}

/// Marks an object as live for the current collection mode.
///
/// Young collections set `MARKED`; old collections flip the polarity and
/// set `ALLOCATED`. Small-heap objects additionally mark their block and
/// every line they overlap; the large heap carries no line marks.
pub fn mark(heap: &Heap, object: Ptr<Object>, meta: ObjectMeta, collecting_old: bool) {
    if collecting_old {
        meta.set_allocated();
    } else {
        meta.set_marked();
    }

    let address = object.0 as usize;
    let block = heap.block_meta_for(address);

    if !block.contains_large_objects() {
        block.mark();

        let first_line = heap.line_index(address);
        let last_line = heap.line_index(address + object.size() - WORD_SIZE);

        for line in first_line..=last_line {
            heap.line_meta_at(line).mark();
        }
    }
}

/// Resolves a conservative root to the object containing it.
///
/// Returns null when the address cannot be recovered to an object head:
/// it points into a free block, into a free-list placeholder, below the
/// head of the nearest object, or past the object's end. Liveness is the
/// caller's concern.
pub fn resolve(heap: &Heap, address: usize) -> Ptr<Object> {
    let block = heap.block_meta_for(address);

    if block.is_free() {
        Ptr::null()
    } else if block.contains_large_objects() {
        resolve_large(heap, address)
    } else {
        resolve_small(heap, address)
    }
}

fn head_if_containing(address: usize, head: usize) -> Ptr<Object> {
    let object: Ptr<Object> = Ptr::from_pointer(head as *mut Object);

    // An allocated slot whose descriptor the runtime has not written yet
    // cannot be sized; ignore it like any other unresolvable root.
    if object.get().rtti.is_null() {
        return Ptr::null();
    }

    if address < head + object.size() {
        object
    } else {
        Ptr::null()
    }
}

fn resolve_small(heap: &Heap, address: usize) -> Ptr<Object> {
    let mut current = address & !(ALLOCATION_ALIGNMENT - 1);
    let block_start = heap.block_start_for(address);

    loop {
        let meta = heap.object_meta_for(current);

        if !meta.is_free() {
            return head_if_containing(address, current);
        }

        if current == block_start {
            return Ptr::null();
        }

        current -= ALLOCATION_ALIGNMENT;
    }
}

fn resolve_large(heap: &Heap, address: usize) -> Ptr<Object> {
    let head = heap.superblock_start(heap.block_meta_for(address));
    let superblock_start = heap.block_start(heap.block_index(head));

    let mut current = address & !(MIN_CHUNK_SIZE - 1);

    loop {
        let meta = heap.object_meta_for(current);

        if !meta.is_free() {
            if meta.is_placeholder() {
                // The head of a free chunk still sitting in a free list.
                return Ptr::null();
            }

            return head_if_containing(address, current);
        }

        if current == superblock_start {
            return Ptr::null();
        }

        current -= MIN_CHUNK_SIZE;
    }
}
