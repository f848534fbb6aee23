// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementation targeting QEMU's `virt` machine (AArch64).

use core::ptr::{read_volatile, write_volatile};

use tether_abi::NSEC_PER_SEC;

use crate::arch::aarch64;
use crate::mm::PAGE_SIZE;

use super::{Mmio, Mmu, Timer};

/// Generic-timer backed clock (CNTVCT_EL0 / CNTV_TVAL_EL0).
pub struct VirtTimer;

impl VirtTimer {
    /// Converts nanoseconds into counter ticks at the current frequency.
    pub fn ns_to_ticks(ns: u64) -> u64 {
        let freq = aarch64::counter_frequency();
        ((ns as u128 * freq as u128) / NSEC_PER_SEC as u128) as u64
    }
}

impl Timer for VirtTimer {
    fn now(&self) -> u64 {
        let freq = aarch64::counter_frequency();
        ((aarch64::counter() as u128 * NSEC_PER_SEC as u128) / freq as u128) as u64
    }

    fn set_wakeup(&self, deadline: u64) {
        let delta = deadline.saturating_sub(self.now());
        aarch64::virtual_timer_program(Self::ns_to_ticks(delta).max(1));
    }
}

/// A device register window at a fixed physical address.
#[derive(Clone, Copy)]
pub struct MmioWindow {
    base: usize,
}

impl MmioWindow {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }
}

impl Mmio for MmioWindow {
    unsafe fn write32(&self, offset: usize, value: u32) {
        write_volatile((self.base + offset) as *mut u32, value);
    }

    unsafe fn read32(&self, offset: usize) -> u32 {
        read_volatile((self.base + offset) as *const u32)
    }
}

/// TLB maintenance through `tlbi`, scrubbing through the new mapping.
pub struct VirtMmu;

impl Mmu for VirtMmu {
    fn invalidate_page(&self, va: usize) {
        aarch64::tlb_invalidate_page(va);
    }

    fn invalidate_all(&self) {
        aarch64::tlb_invalidate_all();
    }

    unsafe fn zero_page(&self, va: usize) {
        core::ptr::write_bytes(va as *mut u8, 0, PAGE_SIZE);
    }
}
