// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The kernel's single address space: fixed boot mappings plus demand paging
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace::{new, map_fixed, map_region, handle_fault, translate}
//! DEPENDS_ON: mm::page_table, mm::frame::FramePool, hal::Mmu
//! INVARIANTS: One frame and one TLB invalidation per resolved fault; a second fault on an
//!             already mapped page allocates nothing; repeated faults on one page are fatal

use core::fmt;

use super::layout::{self, Region};
use super::page_table::{MapError, PageFlags, PageTable, TableAlloc};
use super::{align_down, FramePool, MemoryClass, Permissions, BLOCK_SIZE, PAGE_SIZE};
use crate::hal::Mmu;

/// Consecutive faults tolerated on one page before the fault is declared a loop.
pub const MAX_REPEATED_FAULTS: u32 = 3;

/// Virtual range `[floor, ceiling)` the fault handler is allowed to populate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DemandWindow {
    pub floor: usize,
    pub ceiling: usize,
}

impl DemandWindow {
    pub const fn kernel() -> Self {
        Self { floor: layout::DEMAND_FLOOR, ceiling: layout::DEMAND_CEILING }
    }

    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.floor && addr < self.ceiling
    }
}

/// Successful resolution of a translation fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A fresh frame now backs `page`.
    Mapped { page: usize, frame: usize },
    /// `page` was already mapped (stale TLB entry or racing retry); nothing allocated.
    AlreadyMapped { page: usize },
}

/// Reasons a translation fault cannot be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// The address lies below the load floor or beyond the ceiling.
    OutsideWindow { addr: usize },
    /// The frame pool is exhausted.
    OutOfFrames { addr: usize },
    /// The same page keeps faulting after being mapped.
    Repeated { page: usize },
    /// Installing the leaf failed.
    Map(MapError),
    /// No address space has been published yet.
    NotReady,
}

impl From<MapError> for FaultError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::OutsideWindow { addr } => write!(f, "address {:#x} outside demand window", addr),
            FaultError::OutOfFrames { addr } => write!(f, "frame pool exhausted at {:#x}", addr),
            FaultError::Repeated { page } => write!(f, "page {:#x} faulted repeatedly", page),
            FaultError::Map(err) => write!(f, "map failed: {}", err),
            FaultError::NotReady => f.write_str("address space not installed"),
        }
    }
}

/// Page-table tree plus the frame pool and window that feed it.
pub struct AddressSpace<A: TableAlloc, M: Mmu> {
    table: PageTable<A>,
    frames: FramePool,
    mmu: M,
    window: DemandWindow,
    last_fault: Option<(usize, u32)>,
    resolved: u64,
}

impl<A: TableAlloc, M: Mmu> AddressSpace<A, M> {
    pub fn new(
        tables: A,
        frames: FramePool,
        mmu: M,
        window: DemandWindow,
    ) -> Result<Self, MapError> {
        Ok(Self { table: PageTable::new(tables)?, frames, mmu, window, last_fault: None, resolved: 0 })
    }

    /// Value for TTBR0_EL1.
    pub fn root_address(&self) -> u64 {
        self.table.root_address()
    }

    /// Eagerly maps `[va, va + len)` onto `[pa, pa + len)`.
    ///
    /// Uses 2 MiB blocks wherever both addresses and the remaining length allow it.
    /// Returns the number of bytes mapped.
    pub fn map_fixed(
        &mut self,
        va: usize,
        pa: usize,
        len: usize,
        perms: Permissions,
        class: MemoryClass,
    ) -> Result<usize, MapError> {
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        let flags = PageFlags::leaf(perms, class);
        let mut offset = 0;
        while offset < len {
            let (v, p, left) = (va + offset, pa + offset, len - offset);
            if v % BLOCK_SIZE == 0 && p % BLOCK_SIZE == 0 && left >= BLOCK_SIZE {
                self.table.map_block(v, p, flags)?;
                offset += BLOCK_SIZE;
            } else {
                self.table.map_page(v, p, flags)?;
                offset += PAGE_SIZE;
            }
        }
        Ok(len)
    }

    /// Identity maps a fixed region from the memory map.
    pub fn map_region(&mut self, region: &Region) -> Result<usize, MapError> {
        self.map_fixed(region.base, region.base, region.size, region.perms, region.class)
    }

    /// Maps one page at `va` backed by a fresh frame; used by the loader.
    pub fn map_fresh_page(&mut self, va: usize, perms: Permissions) -> Result<usize, FaultError> {
        let frame = self.frames.alloc_frame().ok_or(FaultError::OutOfFrames { addr: va })?;
        self.table.map_page(va, frame, PageFlags::leaf(perms, MemoryClass::Normal))?;
        self.mmu.invalidate_page(va);
        Ok(frame)
    }

    /// Changes the permissions of an already mapped page and drops its stale TLB entry.
    pub fn protect_page(&mut self, va: usize, perms: Permissions) -> Result<(), MapError> {
        self.table.protect_page(va, PageFlags::leaf(perms, MemoryClass::Normal))?;
        self.mmu.invalidate_page(va);
        Ok(())
    }

    /// Resolves a translation fault at `addr`.
    pub fn handle_fault(&mut self, addr: usize) -> Result<FaultOutcome, FaultError> {
        let page = align_down(addr, PAGE_SIZE);
        self.note_fault(page)?;
        if !self.window.contains(addr) {
            return Err(FaultError::OutsideWindow { addr });
        }
        if self.table.lookup(page).is_some() {
            return Ok(FaultOutcome::AlreadyMapped { page });
        }
        let frame = self.frames.alloc_frame().ok_or(FaultError::OutOfFrames { addr })?;
        let flags = PageFlags::leaf(Permissions::ReadWrite, MemoryClass::Normal);
        self.table.map_page(page, frame, flags)?;
        self.mmu.invalidate_page(page);
        // SAFETY: `page` was mapped RW just above and nothing else references the frame.
        unsafe { self.mmu.zero_page(page) };
        self.resolved += 1;
        Ok(FaultOutcome::Mapped { page, frame })
    }

    fn note_fault(&mut self, page: usize) -> Result<(), FaultError> {
        let repeats = match self.last_fault {
            Some((last, n)) if last == page => n + 1,
            _ => 1,
        };
        self.last_fault = Some((page, repeats));
        if repeats > MAX_REPEATED_FAULTS {
            return Err(FaultError::Repeated { page });
        }
        Ok(())
    }

    /// Physical address `va` translates to, if mapped.
    pub fn translate(&self, va: usize) -> Option<usize> {
        self.table.lookup(va).map(|leaf| leaf.pa)
    }

    /// Descriptor flags for `va`, if mapped.
    pub fn flags(&self, va: usize) -> Option<PageFlags> {
        self.table.lookup(va).map(|leaf| leaf.flags)
    }

    /// Number of faults resolved with a fresh frame.
    pub fn resolved_faults(&self) -> u64 {
        self.resolved
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    pub fn table_pages(&self) -> usize {
        self.table.table_count()
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }
}
