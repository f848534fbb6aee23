// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Four-level AArch64 translation table (4 KiB granule, 48-bit VA) with lazy
//! allocation of intermediate levels.

use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;

use super::{MemoryClass, Permissions, BLOCK_SIZE, PAGE_SIZE};

/// Number of descriptors per table page.
const PT_ENTRIES: usize = 512;
/// Bits [47:12] of a descriptor hold the output address.
const OUTPUT_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;
/// Size of the virtual address space covered by TTBR0.
pub const VA_BITS: u32 = 48;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Descriptor bits for VMSAv8-64 stage 1 translation.
    pub struct PageFlags: u64 {
        const VALID = 1 << 0;
        /// Table descriptor at levels 0-2, page descriptor at level 3.
        const TABLE_OR_PAGE = 1 << 1;
        /// AttrIndx = 1 (device-nGnRnE); index 0 is normal memory.
        const ATTR_DEVICE = 1 << 2;
        /// AP[1]: EL0 access.
        const AP_EL0 = 1 << 6;
        /// AP[2]: read-only.
        const AP_RO = 1 << 7;
        const SH_INNER = 0b11 << 8;
        const ACCESSED = 1 << 10;
        const NOT_GLOBAL = 1 << 11;
        const PXN = 1 << 53;
        const UXN = 1 << 54;
    }
}

impl PageFlags {
    /// Leaf attributes for a mapping with `perms` under `class`.
    ///
    /// The result carries no level-specific type bit; `map_page` and
    /// `map_block` add or omit `TABLE_OR_PAGE` themselves.
    pub const fn leaf(perms: Permissions, class: MemoryClass) -> Self {
        let mut bits = Self::VALID.bits() | Self::ACCESSED.bits();
        bits |= match class {
            MemoryClass::Normal => Self::SH_INNER.bits(),
            MemoryClass::Device => Self::ATTR_DEVICE.bits(),
        };
        bits |= match perms {
            Permissions::ReadOnly => Self::AP_RO.bits() | Self::PXN.bits() | Self::UXN.bits(),
            Permissions::ReadWrite => Self::PXN.bits() | Self::UXN.bits(),
            Permissions::ReadExecute => Self::AP_RO.bits() | Self::UXN.bits(),
        };
        if matches!(class, MemoryClass::Device) {
            bits |= Self::PXN.bits() | Self::UXN.bits();
        }
        Self::from_bits_retain(bits)
    }

    const fn writable(self) -> bool {
        !self.contains(Self::AP_RO)
    }

    const fn executable(self) -> bool {
        !self.contains(Self::PXN)
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not aligned to the mapping size.
    Unaligned,
    /// Mapping extends beyond the 48-bit TTBR0 range.
    OutOfRange,
    /// Mapping would be both writable and executable.
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// The table allocator ran dry.
    OutOfTables,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One 4 KiB page of descriptors.
#[repr(C, align(4096))]
pub struct TablePage {
    entries: [u64; PT_ENTRIES],
}

impl TablePage {
    pub const fn new() -> Self {
        Self { entries: [0; PT_ENTRIES] }
    }
}

impl Default for TablePage {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of zeroed table pages whose virtual address equals their physical address.
pub trait TableAlloc {
    fn alloc_table(&mut self) -> Option<NonNull<TablePage>>;
}

/// Result of a successful `lookup`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Leaf {
    /// Physical address `va` translates to.
    pub pa: usize,
    /// Attributes of the descriptor.
    pub flags: PageFlags,
    /// Bytes covered by the descriptor (page or block).
    pub size: usize,
}

/// Four-level translation table allocating intermediate levels on demand.
pub struct PageTable<A: TableAlloc> {
    root: NonNull<TablePage>,
    alloc: A,
    tables: usize,
}

// SAFETY: the tree is only reachable through `&mut self` once built, and every
// table page it points to is owned exclusively by it.
unsafe impl<A: TableAlloc + Send> Send for PageTable<A> {}

impl<A: TableAlloc> PageTable<A> {
    /// Creates an empty table with a fresh root page.
    pub fn new(mut alloc: A) -> Result<Self, MapError> {
        let root = alloc.alloc_table().ok_or(MapError::OutOfTables)?;
        Ok(Self { root, alloc, tables: 1 })
    }

    /// Value to program into TTBR0_EL1.
    pub fn root_address(&self) -> u64 {
        self.root.as_ptr() as u64
    }

    /// Number of table pages in use, root included.
    pub fn table_count(&self) -> usize {
        self.tables
    }

    /// Translates `va`, returning the leaf that covers it.
    pub fn lookup(&self, va: usize) -> Option<Leaf> {
        if !is_canonical(va) {
            return None;
        }
        let indices = level_indices(va);
        let mut table = self.root;
        for (level, index) in indices.iter().enumerate() {
            // SAFETY: every table pointer reachable from the root came from `alloc_table`.
            let entry = unsafe { (*table.as_ptr()).entries[*index] };
            if entry & PageFlags::VALID.bits() == 0 {
                return None;
            }
            let flags = PageFlags::from_bits_retain(entry & !OUTPUT_ADDR_MASK);
            let out = (entry & OUTPUT_ADDR_MASK) as usize;
            let has_type = entry & PageFlags::TABLE_OR_PAGE.bits() != 0;
            match (level, has_type) {
                (3, true) => {
                    return Some(Leaf { pa: out | (va & (PAGE_SIZE - 1)), flags, size: PAGE_SIZE })
                }
                (2, false) => {
                    return Some(Leaf { pa: out | (va & (BLOCK_SIZE - 1)), flags, size: BLOCK_SIZE })
                }
                (0..=2, true) => table = NonNull::new(out as *mut TablePage)?,
                _ => return None,
            }
        }
        None
    }

    /// Installs a 4 KiB mapping from `va` to `pa`.
    pub fn map_page(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        Self::check(va, pa, PAGE_SIZE, flags)?;
        let table = self.walk_alloc(va, 3)?;
        let index = level_indices(va)[3];
        // SAFETY: `walk_alloc` returns a live table owned by this tree.
        let entry = unsafe { &mut (*table.as_ptr()).entries[index] };
        if *entry & PageFlags::VALID.bits() != 0 {
            return Err(MapError::Overlap);
        }
        *entry = (pa as u64 & OUTPUT_ADDR_MASK) | (flags | PageFlags::TABLE_OR_PAGE).bits();
        Ok(())
    }

    /// Installs a 2 MiB level-2 block mapping from `va` to `pa`.
    pub fn map_block(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        Self::check(va, pa, BLOCK_SIZE, flags)?;
        let table = self.walk_alloc(va, 2)?;
        let index = level_indices(va)[2];
        // SAFETY: `walk_alloc` returns a live table owned by this tree.
        let entry = unsafe { &mut (*table.as_ptr()).entries[index] };
        if *entry & PageFlags::VALID.bits() != 0 {
            return Err(MapError::Overlap);
        }
        *entry = (pa as u64 & OUTPUT_ADDR_MASK) | (flags - PageFlags::TABLE_OR_PAGE).bits();
        Ok(())
    }

    /// Rewrites the attributes of the existing 4 KiB leaf at `va`, keeping its output address.
    ///
    /// The caller invalidates the TLB entry afterwards.
    pub fn protect_page(&mut self, va: usize, flags: PageFlags) -> Result<(), MapError> {
        let pa = match self.lookup(va) {
            Some(leaf) if leaf.size == PAGE_SIZE => leaf.pa & !(PAGE_SIZE - 1),
            Some(_) => return Err(MapError::Overlap),
            None => return Err(MapError::OutOfRange),
        };
        Self::check(va, pa, PAGE_SIZE, flags)?;
        let table = self.walk_alloc(va, 3)?;
        let index = level_indices(va)[3];
        // SAFETY: `walk_alloc` returns a live table owned by this tree.
        let entry = unsafe { &mut (*table.as_ptr()).entries[index] };
        *entry = (pa as u64 & OUTPUT_ADDR_MASK) | (flags | PageFlags::TABLE_OR_PAGE).bits();
        Ok(())
    }

    fn check(va: usize, pa: usize, size: usize, flags: PageFlags) -> Result<(), MapError> {
        if va % size != 0 || pa % size != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical(va) || !is_canonical(va + size - 1) {
            return Err(MapError::OutOfRange);
        }
        if !flags.contains(PageFlags::VALID | PageFlags::ACCESSED) {
            return Err(MapError::InvalidFlags);
        }
        if flags.writable() && flags.executable() {
            return Err(MapError::PermissionDenied);
        }
        Ok(())
    }

    /// Walks from the root to the table at `target_level`, allocating missing levels.
    fn walk_alloc(&mut self, va: usize, target_level: usize) -> Result<NonNull<TablePage>, MapError> {
        let indices = level_indices(va);
        let mut table = self.root;
        for index in indices.iter().take(target_level) {
            // SAFETY: see `lookup`.
            let entry = unsafe { &mut (*table.as_ptr()).entries[*index] };
            if *entry & PageFlags::VALID.bits() != 0 {
                if *entry & PageFlags::TABLE_OR_PAGE.bits() == 0 {
                    // A block already covers this range.
                    return Err(MapError::Overlap);
                }
                let next = (*entry & OUTPUT_ADDR_MASK) as *mut TablePage;
                table = NonNull::new(next).ok_or(MapError::OutOfRange)?;
                continue;
            }
            let next = self.alloc.alloc_table().ok_or(MapError::OutOfTables)?;
            self.tables += 1;
            *entry = (next.as_ptr() as u64 & OUTPUT_ADDR_MASK)
                | (PageFlags::VALID | PageFlags::TABLE_OR_PAGE).bits();
            table = next;
        }
        Ok(table)
    }
}

/// Table indices for levels 0 through 3.
pub const fn level_indices(va: usize) -> [usize; 4] {
    [(va >> 39) & 0x1ff, (va >> 30) & 0x1ff, (va >> 21) & 0x1ff, (va >> 12) & 0x1ff]
}

/// Returns `true` when `va` is reachable through TTBR0.
pub const fn is_canonical(va: usize) -> bool {
    (va as u64) >> VA_BITS == 0
}
