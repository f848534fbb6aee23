// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! AArch64 specific helpers used across the tether kernel.
//!
//! Everything here targets EL1 on a single core of the QEMU `virt` machine.
//! Host builds get inert stubs so the policy code layered on top (paging,
//! syscalls, preemption decisions) can be exercised by unit tests.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use aarch64_cpu::{asm::barrier, registers::*};

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counter frequency assumed when CNTFRQ_EL0 reads zero (QEMU `virt` default).
pub const DEFAULT_COUNTER_HZ: u64 = 62_500_000;

const DAIF_IRQ: u64 = 1 << 7;
const SCTLR_M: u64 = 1 << 0;
const SCTLR_C: u64 = 1 << 2;
const SCTLR_I: u64 = 1 << 12;

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
static HOST_COUNTER: AtomicU64 = AtomicU64::new(0);
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
static HOST_VBAR: AtomicUsize = AtomicUsize::new(0);
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
static HOST_TVAL: AtomicU64 = AtomicU64::new(0);

/// Clears the `.bss` region defined by the linker.
#[inline]
pub fn clear_bss(start: *mut u8, end: *mut u8) {
    let mut ptr = start;
    while ptr < end {
        // SAFETY: the caller hands us the linker-provided bss bounds.
        unsafe {
            core::ptr::write_volatile(ptr, 0);
            ptr = ptr.add(1);
        }
    }
}

/// Returns affinity level 0 of MPIDR_EL1, i.e. the core number within the cluster.
#[inline]
pub fn core_id() -> usize {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        (MPIDR_EL1.get() & 0xff) as usize
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        0
    }
}

/// Reads the virtual counter.
#[inline]
pub fn counter() -> u64 {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        barrier::isb(barrier::SY);
        CNTVCT_EL0.get()
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        HOST_COUNTER.fetch_add(1_000, Ordering::Relaxed)
    }
}

/// Returns the counter frequency in Hz, falling back to the `virt` default when unset.
#[inline]
pub fn counter_frequency() -> u64 {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    let freq = CNTFRQ_EL0.get();
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let freq = 0;
    if freq == 0 {
        DEFAULT_COUNTER_HZ
    } else {
        freq
    }
}

/// Writes VBAR_EL1.
#[inline]
pub fn write_vbar(base: usize) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        VBAR_EL1.set(base as u64);
        barrier::isb(barrier::SY);
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    HOST_VBAR.store(base, Ordering::Relaxed);
}

/// Reads VBAR_EL1.
#[inline]
pub fn read_vbar() -> usize {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        VBAR_EL1.get() as usize
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        HOST_VBAR.load(Ordering::Relaxed)
    }
}

/// Returns `true` when PSTATE.I is set.
#[inline]
pub fn irqs_masked() -> bool {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        DAIF.get() & DAIF_IRQ != 0
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        let _ = DAIF_IRQ;
        true
    }
}

/// Masks IRQs on the current core.
#[inline]
pub fn mask_irqs() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("msr daifset, #2", options(nomem, nostack, preserves_flags));
    }
}

/// Unmasks IRQs on the current core.
#[inline]
pub fn unmask_irqs() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags));
    }
}

/// Waits for the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    aarch64_cpu::asm::wfi();
}

/// Masks interrupts and parks the core forever.
pub fn halt() -> ! {
    mask_irqs();
    loop {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        aarch64_cpu::asm::wfe();
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        core::hint::spin_loop();
    }
}

/// Invalidates the translation cache entry for a single page, all ASIDs.
#[inline]
pub fn tlb_invalidate_page(va: usize) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1, {page}",
            "dsb ish",
            "isb",
            page = in(reg) va >> 12,
            options(nostack, preserves_flags)
        );
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = va;
}

/// Invalidates every EL1 translation cache entry.
#[inline]
pub fn tlb_invalidate_all() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vmalle1",
            "dsb ish",
            "isb",
            options(nostack, preserves_flags)
        );
    }
}

/// Makes freshly written code in `[start, start + len)` visible to instruction fetch.
pub fn sync_instruction_cache(start: usize, len: usize) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        const LINE: usize = 64;
        let mut line = start & !(LINE - 1);
        while line < start + len {
            // SAFETY: cache maintenance by VA on a mapped range has no other effect.
            unsafe { core::arch::asm!("dc cvau, {line}", line = in(reg) line, options(nostack, preserves_flags)) };
            line += LINE;
        }
        // SAFETY: barrier and whole-cache invalidate only.
        unsafe {
            core::arch::asm!("dsb ish", "ic iallu", "dsb ish", "isb", options(nostack, preserves_flags));
        }
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = (start, len);
}

/// Loads CNTV_TVAL_EL0 and enables the virtual timer with its interrupt unmasked.
#[inline]
pub fn virtual_timer_program(ticks: u64) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        CNTV_TVAL_EL0.set(ticks);
        CNTV_CTL_EL0.set(1);
        barrier::isb(barrier::SY);
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    HOST_TVAL.store(ticks, Ordering::Relaxed);
}

/// Returns the last value programmed into the host timer stub.
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn host_timer_tval() -> u64 {
    HOST_TVAL.load(Ordering::Relaxed)
}

/// Disables the virtual timer.
#[inline]
pub fn virtual_timer_stop() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    CNTV_CTL_EL0.set(0);
}

/// Programs MAIR/TCR/TTBR0 and turns on the MMU and caches.
///
/// # Safety
///
/// `ttbr0` must reference a complete translation tree that identity maps the
/// currently executing code and the active stack.
pub unsafe fn enable_translation(mair: u64, tcr: u64, ttbr0: u64) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        MAIR_EL1.set(mair);
        TCR_EL1.set(tcr);
        TTBR0_EL1.set(ttbr0);
        barrier::isb(barrier::SY);
        tlb_invalidate_all();
        SCTLR_EL1.set(SCTLR_EL1.get() | SCTLR_M | SCTLR_C | SCTLR_I);
        barrier::isb(barrier::SY);
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        let _ = (mair, tcr, ttbr0, SCTLR_M, SCTLR_C, SCTLR_I);
    }
}

/// Returns the value of TTBR0_EL1, or zero on host builds.
#[inline]
pub fn translation_root() -> u64 {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        TTBR0_EL1.get()
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        0
    }
}
