//! Root discovery.
//!
//! The collector receives no precise root map for stacks: every
//! word-aligned slot between the saved-register area and the runtime's
//! registered stack bottom is treated as a potential pointer. Module
//! roots are precise head pointers kept in a flat buffer by the runtime.

use crate::config::WORD_SIZE;
use crate::gc::grey_packet::GreyPacket;
use crate::gc::marker;
use crate::heap::Heap;
use crate::util::ptr::Ptr;
use crate::Word;

/// The runtime-provided root sources. Modelled as explicit state handed
/// to the heap at initialisation rather than as process-wide statics.
pub struct Roots {
    /// The deepest stack address to scan, one per mutator. Null disables
    /// the stack scan (embedders with their own rooting, and tests).
    pub stack_bottom: *mut Word,

    /// Base and length of the flat array of module root pointers.
    pub modules: *mut *mut Word,
    pub modules_size: usize,

    /// The descriptor id identifying arrays of references.
    pub object_array_id: i32,
}

impl Default for Roots {
    fn default() -> Self {
        Roots {
            stack_bottom: std::ptr::null_mut(),
            modules: std::ptr::null_mut(),
            modules_size: 0,
            object_array_id: -1,
        }
    }
}

unsafe impl Send for Roots {}
unsafe impl Sync for Roots {}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Copies the callee-saved registers into a stack slot before
        /// handing its address to `scan`, so pointers currently living
        /// only in registers are visible to the conservative scan.
        #[inline(never)]
        fn with_spilled_registers<F: FnOnce(usize)>(scan: F) {
            let (rbx, rbp, r12, r13, r14, r15): (usize, usize, usize, usize, usize, usize);

            // Outputs are pinned to caller-saved registers so the
            // compiler cannot hand one of the registers being read out
            // as a destination.
            unsafe {
                std::arch::asm!(
                    "mov rax, rbx",
                    "mov rcx, rbp",
                    "mov rdx, r12",
                    "mov rsi, r13",
                    "mov rdi, r14",
                    "mov r8, r15",
                    out("rax") rbx,
                    out("rcx") rbp,
                    out("rdx") r12,
                    out("rsi") r13,
                    out("rdi") r14,
                    out("r8") r15,
                    options(nomem, nostack, preserves_flags)
                );
            }

            let saved = [rbx, rbp, r12, r13, r14, r15];

            scan(saved.as_ptr() as usize);
            std::hint::black_box(&saved);
        }
    } else if #[cfg(target_arch = "aarch64")] {
        #[inline(never)]
        fn with_spilled_registers<F: FnOnce(usize)>(scan: F) {
            let mut saved = [0usize; 10];

            unsafe {
                std::arch::asm!(
                    "stp x19, x20, [x9]",
                    "stp x21, x22, [x9, #16]",
                    "stp x23, x24, [x9, #32]",
                    "stp x25, x26, [x9, #48]",
                    "stp x27, x28, [x9, #64]",
                    in("x9") saved.as_mut_ptr(),
                    options(nostack, preserves_flags)
                );
            }

            scan(saved.as_ptr() as usize);
            std::hint::black_box(&saved);
        }
    } else {
        /// Fallback without register spilling: the non-inlined call edge
        /// is the only spill this target gets.
        #[inline(never)]
        fn with_spilled_registers<F: FnOnce(usize)>(scan: F) {
            let top = 0usize;

            scan(&top as *const usize as usize);
            std::hint::black_box(&top);
        }
    }
}

/// Conservatively scans the mutator stack from the spilled-register area
/// down to the registered stack bottom. Slots that do not resolve to a
/// live object are ignored.
pub fn mark_program_stack(heap: &Heap, out: &mut Ptr<GreyPacket>, collecting_old: bool) {
    let bottom = heap.roots.stack_bottom as usize;

    if bottom == 0 {
        return;
    }

    with_spilled_registers(|top| {
        let mut current = top;

        while current <= bottom {
            let value = unsafe { *(current as *const usize) };

            if heap.is_address_in_heap(value) {
                marker::mark_conservative(heap, out, value, collecting_old);
            }

            current += WORD_SIZE;
        }
    });
}

/// Marks the module root buffer. These are precise object pointers, so
/// no conservative resolution is involved.
pub fn mark_modules(heap: &Heap, out: &mut Ptr<GreyPacket>, collecting_old: bool) {
    let modules = heap.roots.modules;

    for index in 0..heap.roots.modules_size {
        let address = unsafe { *modules.add(index) } as usize;

        if heap.is_address_in_heap(address) {
            let meta = heap.object_meta_for(address);

            if meta.is_alive(collecting_old) {
                marker::mark_object(
                    heap,
                    out,
                    Ptr::from_pointer(address as *mut crate::object::Object),
                    meta,
                    collecting_old,
                );
            }
        }
    }
}
