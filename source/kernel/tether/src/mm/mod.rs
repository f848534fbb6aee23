// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand-paged memory manager for the single kernel address space
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, PageTable, FramePool, BumpAllocator, layout::MEMORY_MAP,
//!             install_kernel_space(), with_kernel_space(), resolve_fault()
//! DEPENDS_ON: arch::aarch64 (TLB, translation registers), hal::Mmu, bitflags
//! INVARIANTS: Mappings never shrink; fixed regions installed before translation is on;
//!             demand faults map exactly one RW/XN normal page and invalidate exactly one VA

pub mod address_space;
pub mod bump;
pub mod frame;
pub mod layout;
pub mod page_table;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod tests_prop;

use core::fmt;

use spin::Mutex;

pub use address_space::{AddressSpace, DemandWindow, FaultError, FaultOutcome};
pub use bump::{BumpAllocator, BumpError};
pub use frame::{FramePool, RegionTables};
pub use page_table::{MapError, PageFlags, PageTable, TableAlloc};

use crate::hal::virt::VirtMmu;

/// MAIR_EL1: index 0 normal write-back RW-allocate, index 1 device-nGnRnE.
pub const MAIR_VALUE: u64 = 0xff;
/// TCR_EL1: T0SZ=16 (48-bit), inner/outer WB-WA walks, inner shareable, EPD1, 48-bit IPS.
pub const TCR_VALUE: u64 = 16 | (1 << 8) | (1 << 10) | (3 << 12) | (1 << 23) | (2 << 32);

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Size of a level-2 block mapping.
pub const BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Memory attribute class of a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryClass {
    /// Write-back cacheable, inner shareable (MAIR index 0).
    Normal,
    /// Device-nGnRnE, strictly ordered (MAIR index 1).
    Device,
}

/// Access rights of a mapping; writable and executable are mutually exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permissions {
    ReadOnly,
    ReadWrite,
    ReadExecute,
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Permissions::ReadOnly => "r--",
            Permissions::ReadWrite => "rw-",
            Permissions::ReadExecute => "r-x",
        })
    }
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Address space type used by the running kernel.
pub type KernelSpace = AddressSpace<RegionTables, VirtMmu>;

static KERNEL_SPACE: Mutex<Option<KernelSpace>> = Mutex::new(None);

/// Virtual cursor shared by hint-less `mmap` and context stacks.
static BUMP: Mutex<BumpAllocator> = Mutex::new(BumpAllocator::from_region(&layout::MMAP_BUMP));

/// Runs `f` with the shared bump allocator locked.
pub fn with_bump<R>(f: impl FnOnce(&mut BumpAllocator) -> R) -> R {
    let _guard = crate::preempt::disable();
    f(&mut BUMP.lock())
}

/// Programs MAIR/TCR/TTBR0 with the kernel attributes and turns on the MMU and caches.
///
/// # Safety
///
/// `root` must be a complete tree that identity maps the running code, both
/// stacks and every device the kernel touches.
pub unsafe fn enable_translation(root: u64) {
    crate::arch::aarch64::enable_translation(MAIR_VALUE, TCR_VALUE, root);
}

/// Publishes the boot-built address space for the fault path.
pub fn install_kernel_space(space: KernelSpace) {
    *KERNEL_SPACE.lock() = Some(space);
}

/// Runs `f` against the kernel address space, if it has been installed.
pub fn with_kernel_space<R>(f: impl FnOnce(&mut KernelSpace) -> R) -> Option<R> {
    let _guard = crate::preempt::disable();
    KERNEL_SPACE.lock().as_mut().map(f)
}

/// Fault-path entry used by the trap dispatcher.
///
/// Uses `try_lock`: a fault raised while the space is locked cannot be resolved
/// and is reported as [`FaultError::NotReady`].
pub fn resolve_fault(addr: usize) -> Result<FaultOutcome, FaultError> {
    match KERNEL_SPACE.try_lock() {
        Some(mut guard) => match guard.as_mut() {
            Some(space) => space.handle_fault(addr),
            None => Err(FaultError::NotReady),
        },
        None => Err(FaultError::NotReady),
    }
}

#[cfg(test)]
mod register_tests {
    use super::*;

    #[test]
    fn translation_control_fields() {
        assert_eq!(TCR_VALUE & 0x3f, 16);
        assert_eq!((TCR_VALUE >> 32) & 0x7, 2);
        assert_ne!(TCR_VALUE & (1 << 23), 0);
        assert_eq!(MAIR_VALUE & 0xff, 0xff);
        assert_eq!((MAIR_VALUE >> 8) & 0xff, 0x00);
    }

    #[test]
    fn resolve_before_install_is_not_ready() {
        if with_kernel_space(|_| ()).is_none() {
            assert_eq!(resolve_fault(0x4800_0000), Err(FaultError::NotReady));
        }
    }
}
