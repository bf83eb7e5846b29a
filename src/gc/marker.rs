//! The packet-based parallel marker.
//!
//! Every marker thread drains an `in` packet and fills an `out` packet.
//! Newly greyed objects go into `out`; when it fills up it is published
//! on the `full` list and replaced from the `empty` list. A drained `in`
//! packet is swapped for the next full one, and a worker whose `in`
//! turned out rich in work splits the remainder back onto the full list
//! so idle workers can pick it up. Marking is quiescent once every
//! packet outside the remembered sets is back on the empty list.

use crate::gc::grey_packet::{GreyPacket, PacketKind};
use crate::gc::pool::Pool;
use crate::gc::roots;
use crate::heap::Heap;
use crate::meta::object_meta::ObjectMeta;
use crate::object::{self, Object, LAST_FIELD_OFFSET};
use crate::util::ptr::Ptr;
use crate::Word;
use std::sync::atomic::Ordering;

/// The cross-generation edges found while tracing one object.
#[derive(Default)]
struct GenerationEdges {
    to_old: bool,
    to_young: bool,
}

/// Greys an object: flips its metadata to the live value for this mode,
/// marks block and lines, and pushes it on the `out` packet.
pub fn mark_object(
    heap: &Heap,
    out: &mut Ptr<GreyPacket>,
    target: Ptr<Object>,
    meta: ObjectMeta,
    collecting_old: bool,
) {
    debug_assert!(meta.is_allocated() || meta.is_marked());
    debug_assert!(target.size() != 0);

    object::mark(heap, target, meta, collecting_old);
    heap.mark.objects_marked.fetch_add(1, Ordering::Relaxed);

    if !out.push(target.0 as usize) {
        heap.mark.give_full_packet(*out);
        *out = heap.mark.take_empty_packet();
        out.push(target.0 as usize);
    }
}

/// Resolves a conservative root and greys the containing object if it is
/// live for this mode. Unresolvable addresses are expected and ignored.
pub fn mark_conservative(
    heap: &Heap,
    out: &mut Ptr<GreyPacket>,
    address: usize,
    collecting_old: bool,
) {
    debug_assert!(heap.is_address_in_heap(address));

    let target = object::resolve(heap, address);

    if !target.is_null() {
        let meta = heap.object_meta_for(target.0 as usize);

        if meta.is_alive(collecting_old) {
            mark_object(heap, out, target, meta, collecting_old);
        }
    }
}

/// Traces one field. Records which generation the field points into and
/// greys the target when it is live; returns whether the field pointed
/// into the heap at all.
fn trace_field(
    heap: &Heap,
    out: &mut Ptr<GreyPacket>,
    field: *mut Word,
    edges: &mut GenerationEdges,
    collecting_old: bool,
) -> bool {
    let address = field as usize;

    if !heap.is_address_in_heap(address) {
        return false;
    }

    let meta = heap.object_meta_for(address);

    // Stale pointers left behind by write-barrier races read as free;
    // skip them.
    if meta.is_free() {
        return true;
    }

    let mut field_block = heap.block_meta_for(address);

    if field_block.contains_large_objects() {
        field_block = heap.superblock_start(field_block);
    }

    if field_block.will_be_old(heap.config.max_young_age) {
        edges.to_old = true;
    } else {
        edges.to_young = true;
    }

    if meta.is_alive(collecting_old) {
        mark_object(
            heap,
            out,
            Ptr::from_pointer(address as *mut Object),
            meta,
            collecting_old,
        );
    }

    true
}

/// Whether the object's block survives the current collection as an old
/// block: it is old already, or this collection promotes it.
fn will_be_old(heap: &Heap, target: Ptr<Object>) -> bool {
    let mut block = heap.block_meta_for(target.0 as usize);

    if block.contains_large_objects() {
        block = heap.superblock_start(block);
    }

    block.will_be_old(heap.config.max_young_age)
}

/// After tracing, files the object under the remembered set matching its
/// surviving generation. The remembered bit is claimed atomically so an
/// object split across several refrange batches is appended exactly once.
fn update_remembered_set(
    heap: &Heap,
    target: Ptr<Object>,
    meta: ObjectMeta,
    object_will_be_old: bool,
    edges: &GenerationEdges,
) {
    if object_will_be_old && edges.to_young {
        if meta.try_set_remembered() {
            heap.mark.remember_old_object(target);
        }
    } else if !object_will_be_old && edges.to_old {
        if meta.try_set_remembered() {
            heap.mark.remember_young_object(target);
        }
    }
}

/// Traces a contiguous run of fields belonging to `owner` (an object
/// array, or one batch of a split one).
fn mark_range(
    heap: &Heap,
    owner: Ptr<Object>,
    out: &mut Ptr<GreyPacket>,
    fields: *mut *mut Word,
    length: usize,
    collecting_old: bool,
) -> usize {
    let meta = heap.object_meta_for(owner.0 as usize);
    let owner_will_be_old = will_be_old(heap, owner);
    let mut edges = GenerationEdges::default();
    let mut traced = 0;

    for index in 0..length {
        let field = unsafe { *fields.add(index) };

        if trace_field(heap, out, field, &mut edges, collecting_old) {
            traced += 1;
        }
    }

    update_remembered_set(heap, owner, meta, owner_will_be_old, &edges);

    traced
}

/// Traces a regular object through its descriptor's reference map.
fn mark_regular_object(
    heap: &Heap,
    target: Ptr<Object>,
    out: &mut Ptr<GreyPacket>,
    collecting_old: bool,
) -> usize {
    let meta = heap.object_meta_for(target.0 as usize);

    // Membership is recomputed from scratch on every trace; an object
    // whose cross-generation pointers went away graduates out here.
    meta.set_unremembered();

    let target_will_be_old = will_be_old(heap, target);
    let mut edges = GenerationEdges::default();
    let mut traced = 0;

    let fields = target.fields();
    let mut offset = target.rtti().ref_map;

    unsafe {
        while *offset != LAST_FIELD_OFFSET {
            let field = *fields.add(*offset as usize);

            if trace_field(heap, out, field, &mut edges, collecting_old) {
                traced += 1;
            }

            offset = offset.add(1);
        }
    }

    update_remembered_set(heap, target, meta, target_will_be_old, &edges);

    traced
}

/// Publishes one refrange packet per full batch of a large object array
/// and traces the residual tail inline.
fn split_object_array(
    heap: &Heap,
    owner: Ptr<Object>,
    out: &mut Ptr<GreyPacket>,
    fields: *mut *mut Word,
    length: usize,
    collecting_old: bool,
) -> usize {
    let batch = heap.config.array_split_batch;
    let full_batches = length / batch;

    for index in 0..full_batches {
        let mut slice = heap.mark.take_empty_packet();

        slice.kind = PacketKind::RefRange;
        slice.items[0] = unsafe { fields.add(index * batch) } as usize;
        slice.items[1] = owner.0 as usize;
        // The batch length is a constant; no point writing a size.

        heap.mark.refrange_packets.fetch_add(1, Ordering::Relaxed);
        heap.mark.give_full_packet(slice);
    }

    let tail = length % batch;

    if tail > 0 {
        mark_range(
            heap,
            owner,
            out,
            unsafe { fields.add(full_batches * batch) },
            tail,
            collecting_old,
        )
    } else {
        0
    }
}

/// Traces an object array, splitting it into batches when it is long
/// enough for splitting to buy parallelism.
fn mark_object_array(
    heap: &Heap,
    target: Ptr<Object>,
    out: &mut Ptr<GreyPacket>,
    collecting_old: bool,
) -> usize {
    // Recompute remembered-set membership once, before any batch of this
    // array can race us to the claim.
    heap.object_meta_for(target.0 as usize).set_unremembered();

    let length = target.as_array().length;
    let fields = target.array_fields();

    if length <= heap.config.array_split_threshold {
        mark_range(heap, target, out, fields, length, collecting_old)
    } else {
        split_object_array(heap, target, out, fields, length, collecting_old)
    }
}

/// Splits the unprocessed half of a rich incoming packet back onto the
/// full list for an idle worker.
fn split_incoming_packet(heap: &Heap, incoming: &mut Ptr<GreyPacket>) {
    let to_move = incoming.size as usize / 2;

    if to_move > 0 {
        let mut slice = heap.mark.take_empty_packet();

        incoming.move_items(slice.get(), to_move);
        heap.mark.packet_splits.fetch_add(1, Ordering::Relaxed);
        heap.mark.give_full_packet(slice);
    }
}

fn mark_packet(
    heap: &Heap,
    incoming: &mut Ptr<GreyPacket>,
    out: &mut Ptr<GreyPacket>,
    collecting_old: bool,
) {
    if out.is_null() {
        *out = heap.mark.take_empty_packet();
    }

    let mut traced = 0;

    while !incoming.is_empty() {
        let target: Ptr<Object> = Ptr::from_pointer(incoming.pop() as *mut Object);
        let meta = heap.object_meta_for(target.0 as usize);

        // Garbage can reach a packet through the write barrier; skip it.
        if meta.is_free() {
            continue;
        }

        if target.is_array() {
            if target.rtti().id == heap.roots.object_array_id {
                traced += mark_object_array(heap, target, out, collecting_old);
            }
            // Non-object arrays carry no pointers.
        } else {
            traced += mark_regular_object(heap, target, out, collecting_old);
        }

        if traced > heap.config.mark_max_work_per_packet {
            split_incoming_packet(heap, incoming);
            traced = 0;
        }
    }
}

fn mark_range_packet(
    heap: &Heap,
    incoming: &mut Ptr<GreyPacket>,
    out: &mut Ptr<GreyPacket>,
    collecting_old: bool,
) {
    if out.is_null() {
        *out = heap.mark.take_empty_packet();
    }

    let fields = incoming.items[0] as *mut *mut Word;
    let owner: Ptr<Object> = Ptr::from_pointer(incoming.items[1] as *mut Object);

    mark_range(
        heap,
        owner,
        out,
        fields,
        heap.config.array_split_batch,
        collecting_old,
    );

    incoming.kind = PacketKind::RefList;
    incoming.size = 0;
}

fn mark_batch(
    heap: &Heap,
    incoming: &mut Ptr<GreyPacket>,
    out: &mut Ptr<GreyPacket>,
    collecting_old: bool,
) {
    match incoming.kind {
        PacketKind::RefList => mark_packet(heap, incoming, out, collecting_old),
        PacketKind::RefRange => mark_range_packet(heap, incoming, out, collecting_old),
    }
}

/// The drive loop: drains full packets until none are available. When
/// the full list runs dry but this worker's own `out` packet has work,
/// it self-loops on it instead of exiting.
pub fn mark(heap: &Heap, collecting_old: bool) {
    let mut incoming = heap.mark.take_full_packet();
    let mut out: Ptr<GreyPacket> = Ptr::null();

    while !incoming.is_null() {
        mark_batch(heap, &mut incoming, &mut out, collecting_old);

        debug_assert!(incoming.is_empty());
        debug_assert!(!out.is_null());

        let mut next = heap.mark.take_full_packet();

        if next.is_null() {
            if !out.is_empty() {
                next = out;
                out = incoming;
            } else {
                heap.mark.give_empty_packet(incoming);
                heap.mark.give_empty_packet(out);
                out = Ptr::null();
            }
        } else {
            heap.mark.give_empty_packet(incoming);
        }

        incoming = next;
    }
}

/// The drive loop run by pool workers: identical to [`mark`], plus after
/// every successful packet take it asks the pool to wake enough workers
/// for the packets still queued. Workers that find no packet simply
/// return, so the worker count tracks the available work.
pub fn mark_and_scale(heap: &Heap, collecting_old: bool, pool: &Pool) {
    let mut incoming = heap.mark.take_full_packet();
    let mut out: Ptr<GreyPacket> = Ptr::null();

    while !incoming.is_null() {
        mark_batch(heap, &mut incoming, &mut out, collecting_old);

        debug_assert!(incoming.is_empty());
        debug_assert!(!out.is_null());

        let mut next = heap.mark.take_full_packet();

        if next.is_null() {
            if !out.is_empty() {
                next = out;
                out = incoming;
            } else {
                heap.mark.give_empty_packet(incoming);
                heap.mark.give_empty_packet(out);
                out = Ptr::null();
            }
        } else {
            heap.mark.give_empty_packet(incoming);

            let remaining = heap.mark.full.len() as usize;

            pool.scale_markers(Ptr::from_ref(heap), collecting_old, remaining);
        }

        incoming = next;
    }
}

/// Scans the roots into grey packets: the conservative stack scan, the
/// module root buffer, and the remembered set of the generation being
/// collected (seeded separately by the heap).
pub fn mark_roots(heap: &Heap, collecting_old: bool) {
    let mut out = heap.mark.take_empty_packet();

    roots::mark_program_stack(heap, &mut out, collecting_old);
    roots::mark_modules(heap, &mut out, collecting_old);

    if out.is_empty() {
        heap.mark.give_empty_packet(out);
    } else {
        heap.mark.give_full_packet(out);
    }
}

pub fn is_mark_done(heap: &Heap) -> bool {
    heap.mark.is_mark_done()
}

/// Drives marking to quiescence on the calling thread, yielding between
/// attempts so it does not busy-wait on the racy packet counters while
/// the pool workers finish their packets.
pub fn mark_until_done(heap: &Heap, collecting_old: bool) {
    while !is_mark_done(heap) {
        mark(heap, collecting_old);

        if !is_mark_done(heap) {
            std::thread::yield_now();
        }
    }

    debug_assert_eq!(heap.mark.full.len(), 0);
}
