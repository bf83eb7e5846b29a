//! Collection machinery: grey packets, the parallel marker, the striped
//! sweeper, root discovery and the worker pool.

pub mod grey_packet;
pub mod marker;
pub mod pool;
pub mod roots;
pub mod sweeper;

use crate::object::Object;
use crate::util::ptr::Ptr;
use grey_packet::{GreyList, GreyPacket, PacketKind};
use parking_lot::Mutex;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// All marking state rooted in the heap.
///
/// Packets are preallocated in one slab and move between four intrusive
/// lists: `empty`, `full` and the two remembered sets. Two packets are
/// permanently held out as the heads the remembered sets are currently
/// appending into. Marking is quiescent when every packet not in a
/// remembered set (and not a head) is back on the empty list.
pub struct MarkState {
    packets: Box<[GreyPacket]>,
    pub total: u32,

    pub empty: GreyList,
    pub full: GreyList,

    /// Old objects holding pointers to young objects; seeds the root set
    /// of the next young collection.
    pub remembered_old: GreyList,

    /// Young objects holding pointers to old objects; seeds the root set
    /// of the next old collection.
    pub remembered_young: GreyList,

    /// The packets the remembered sets are currently appending into.
    pub old_roots: Mutex<Ptr<GreyPacket>>,
    pub young_roots: Mutex<Ptr<GreyPacket>>,

    /// Side-channel counters; cheap enough to keep unconditionally and
    /// the only way tests can observe packet traffic.
    pub objects_marked: AtomicUsize,
    pub refrange_packets: AtomicUsize,
    pub packet_splits: AtomicUsize,
}

unsafe impl Send for MarkState {}
unsafe impl Sync for MarkState {}

impl MarkState {
    pub fn new(total: u32) -> Self {
        assert!(total >= 4);

        let packets: Box<[GreyPacket]> =
            (0..total).map(|_| GreyPacket::new()).collect::<Vec<_>>().into();

        let state = MarkState {
            packets,
            total,
            empty: GreyList::new(),
            full: GreyList::new(),
            remembered_old: GreyList::new(),
            remembered_young: GreyList::new(),
            old_roots: Mutex::new(Ptr::null()),
            young_roots: Mutex::new(Ptr::null()),
            objects_marked: AtomicUsize::new(0),
            refrange_packets: AtomicUsize::new(0),
            packet_splits: AtomicUsize::new(0),
        };

        let base = state.packet_base();

        for index in 0..total as usize {
            state.empty.push(base, base.add(index));
        }

        *state.old_roots.lock() = state.take_empty_packet();
        *state.young_roots.lock() = state.take_empty_packet();

        state
    }

    #[inline(always)]
    pub fn packet_base(&self) -> Ptr<GreyPacket> {
        Ptr::from_pointer(self.packets.as_ptr() as *mut GreyPacket)
    }

    /// Takes a packet from the empty list. The pool is provisioned at
    /// init so that this cannot run dry while the packet invariant holds.
    pub fn take_empty_packet(&self) -> Ptr<GreyPacket> {
        let mut packet = self.empty.pop(self.packet_base());

        assert!(!packet.is_null(), "grey packet pool exhausted");

        // A racing worker that returned this packet may not have reset the
        // size yet; just write it here and save the fence.
        packet.size = 0;
        packet.kind = PacketKind::RefList;

        packet
    }

    pub fn give_empty_packet(&self, packet: Ptr<GreyPacket>) {
        debug_assert!(packet.is_empty());

        self.empty.push(self.packet_base(), packet);
    }

    /// Publishes a packet of work. The release fence makes its contents
    /// visible to whichever consumer later pops it.
    pub fn give_full_packet(&self, packet: Ptr<GreyPacket>) {
        debug_assert!(packet.kind == PacketKind::RefRange || packet.size > 0);
        debug_assert!(self.full.len() <= self.total);

        fence(Ordering::Release);
        self.full.push(self.packet_base(), packet);
    }

    pub fn take_full_packet(&self) -> Ptr<GreyPacket> {
        let packet = self.full.pop(self.packet_base());

        if !packet.is_null() {
            fence(Ordering::Acquire);

            debug_assert!(packet.kind == PacketKind::RefRange || packet.size > 0);
        }

        packet
    }

    /// Appends an old object holding a young pointer to the remembered
    /// set that seeds the next young collection.
    pub fn remember_old_object(&self, object: Ptr<Object>) {
        let mut head = self.old_roots.lock();

        if !head.push(object.0 as usize) {
            fence(Ordering::Release);
            self.remembered_old.push(self.packet_base(), *head);

            *head = self.take_empty_packet();
            head.push(object.0 as usize);
        }
    }

    /// Appends a young object holding an old pointer to the remembered
    /// set that seeds the next old collection.
    pub fn remember_young_object(&self, object: Ptr<Object>) {
        let mut head = self.young_roots.lock();

        if !head.push(object.0 as usize) {
            fence(Ordering::Release);
            self.remembered_young.push(self.packet_base(), *head);

            *head = self.take_empty_packet();
            head.push(object.0 as usize);
        }
    }

    /// Moves the remembered set of the generation being collected onto
    /// the full list as initial marking work.
    pub fn seed_from_remembered_set(&self, collecting_old: bool) {
        let base = self.packet_base();

        let (list, head) = if collecting_old {
            (&self.remembered_young, &self.young_roots)
        } else {
            (&self.remembered_old, &self.old_roots)
        };

        loop {
            let packet = list.pop(base);

            if packet.is_null() {
                break;
            }

            self.give_full_packet(packet);
        }

        let mut held = head.lock();

        if !held.is_empty() {
            let fresh = self.take_empty_packet();

            self.give_full_packet(std::mem::replace(&mut *held, fresh));
        }
    }

    /// Marking is done when every packet is accounted for: all of them on
    /// the empty list except those parked in the remembered sets and the
    /// two heads the mutator-facing barrier appends into. The counters
    /// involved are racy, so callers poll this with a yield in between.
    pub fn is_mark_done(&self) -> bool {
        let parked = self.remembered_old.len() + self.remembered_young.len() + 2;

        self.empty.len() == self.total - parked
    }

    pub fn reset_counters(&self) {
        self.objects_marked.store(0, Ordering::Relaxed);
        self.refrange_packets.store(0, Ordering::Relaxed);
        self.packet_splits.store(0, Ordering::Relaxed);
    }

    /// The number of objects currently parked in the remembered set
    /// heads, for diagnostics and tests.
    pub fn remembered_old_len(&self) -> usize {
        self.old_roots.lock().size as usize
            + self.remembered_old.len() as usize * crate::config::GREY_PACKET_ITEMS
    }

    pub fn remembered_young_len(&self) -> usize {
        self.young_roots.lock().size as usize
            + self.remembered_young.len() as usize * crate::config::GREY_PACKET_ITEMS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_quiescent() {
        let state = MarkState::new(16);

        assert_eq!(state.empty.len(), 14);
        assert!(state.is_mark_done());
    }

    #[test]
    fn test_take_and_give_full() {
        let state = MarkState::new(16);

        let mut packet = state.take_empty_packet();
        packet.push(0xdead_beef);

        state.give_full_packet(packet);
        assert!(!state.is_mark_done());

        let taken = state.take_full_packet();
        assert_eq!(taken, packet);

        let mut taken = taken;
        taken.pop();
        state.give_empty_packet(taken);
        assert!(state.is_mark_done());
    }

    #[test]
    fn test_remembered_set_overflow_parks_packets() {
        let state = MarkState::new(16);
        let fake = Ptr::from_pointer(0x10 as *mut Object);

        for _ in 0..crate::config::GREY_PACKET_ITEMS + 1 {
            state.remember_old_object(fake);
        }

        assert_eq!(state.remembered_old.len(), 1);
        assert_eq!(state.old_roots.lock().size, 1);
        assert!(state.is_mark_done());
    }

    #[test]
    fn test_seed_from_remembered_set() {
        let state = MarkState::new(16);
        let fake = Ptr::from_pointer(0x10 as *mut Object);

        state.remember_old_object(fake);
        state.seed_from_remembered_set(false);

        assert_eq!(state.full.len(), 1);
        assert!(state.old_roots.lock().is_empty());
    }
}
