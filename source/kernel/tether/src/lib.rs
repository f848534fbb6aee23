// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TETHER, a single-core AArch64 kernel that hosts one managed runtime
//! OWNERS: @kernel-team
//! PUBLIC API: boot::kernel_entry(RuntimeEntry), init_heap(), subsystem modules
//! DEPENDS_ON: tether-abi (Linux ABI numbers), spin, bitflags, linked_list_allocator,
//!             aarch64-cpu (target only)
//! INVARIANTS: Hardware access is confined to `target_os = "none"` builds; host builds
//!             exercise the same logic against in-memory stand-ins

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod determinism;
pub mod diag;
pub mod hal;
pub mod irq;
pub mod loader;
pub mod mm;
mod panic;
pub mod preempt;
pub mod sched;
#[cfg(feature = "selftest")]
pub mod selftest;
pub mod syscall;
pub mod timer;
pub mod trap;
pub mod uart;

pub use boot::{kernel_entry, RuntimeEntry};
pub use diag::log;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod heap {
    use core::alloc::{GlobalAlloc, Layout};

    use linked_list_allocator::LockedHeap;

    /// Kernel heap; the lock is never held across a preemption point.
    pub struct KernelHeap(pub LockedHeap);

    // SAFETY: every call is forwarded to `LockedHeap` with preemption held off,
    // so an injected switch never leaves the heap lock owned by a parked context.
    unsafe impl GlobalAlloc for KernelHeap {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let _guard = crate::preempt::disable();
            self.0.alloc(layout)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            let _guard = crate::preempt::disable();
            self.0.dealloc(ptr, layout)
        }
    }

    #[global_allocator]
    pub static HEAP: KernelHeap = KernelHeap(LockedHeap::empty());
}

/// Hands the fixed kernel heap region to the global allocator. Called once, before
/// the first allocation.
pub fn init_heap() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        let region = &mm::layout::KERNEL_HEAP;
        // SAFETY: the heap region is reserved in the memory map, identity mapped and
        // unused by anything else; this runs once on the boot path.
        unsafe { heap::HEAP.0.lock().init(region.base as *mut u8, region.size) };
    }
}
