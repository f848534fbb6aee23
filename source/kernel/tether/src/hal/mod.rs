// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

pub mod virt;

/// Abstraction for a monotonic timer.
pub trait Timer {
    /// Returns the current time in nanoseconds.
    fn now(&self) -> u64;
    /// Programs the next wake-up time in nanoseconds.
    fn set_wakeup(&self, deadline: u64);
}

/// Minimal MMIO accessor.
pub trait Mmio {
    /// Writes a 32-bit value to the device.
    ///
    /// # Safety
    ///
    /// `offset` must name a register of the device behind this window.
    unsafe fn write32(&self, offset: usize, value: u32);
    /// Reads a 32-bit value from the device.
    ///
    /// # Safety
    ///
    /// `offset` must name a register of the device behind this window.
    unsafe fn read32(&self, offset: usize) -> u32;
}

/// Interrupt controller primitive.
pub trait IrqCtl {
    /// Enables the interrupt line.
    fn enable(&self, irq: u32);
    /// Disables the interrupt line.
    fn disable(&self, irq: u32);
}

/// Translation-cache maintenance and page scrubbing used by the fault path.
pub trait Mmu {
    /// Invalidates the cached translation of the page containing `va`.
    fn invalidate_page(&self, va: usize);
    /// Flushes the entire translation cache.
    fn invalidate_all(&self);
    /// Zeroes the freshly mapped page at `va`.
    ///
    /// # Safety
    ///
    /// `va` must be page aligned and mapped writable.
    unsafe fn zero_page(&self, va: usize);
}
