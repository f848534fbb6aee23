// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Named memory map of the QEMU `virt` machine (1 GiB RAM at 0x4000_0000).
//!
//! Every subsystem looks regions up here by name; nothing else hard-codes a
//! boundary. `kernel.ld` places `.text` and `.data` inside `kernel-text` and
//! `kernel-data` and asserts they fit.

use super::{MemoryClass, Permissions};

/// How a region is backed at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backing {
    /// Identity mapped eagerly at boot.
    Fixed,
    /// Physical frames handed out one page at a time; never mapped as a whole.
    FramePool,
    /// Virtual range carved by the bump allocator and populated on fault.
    Demand,
}

/// One entry of the memory map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub name: &'static str,
    pub base: usize,
    pub size: usize,
    pub class: MemoryClass,
    pub perms: Permissions,
    pub backing: Backing,
}

impl Region {
    const fn fixed(
        name: &'static str,
        base: usize,
        size: usize,
        class: MemoryClass,
        perms: Permissions,
    ) -> Self {
        Self { name, base, size, class, perms, backing: Backing::Fixed }
    }

    /// One past the last byte of the region.
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    /// Returns `true` if `addr` lies inside the region.
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Returns `true` if the two regions share at least one byte.
    pub const fn overlaps(&self, other: &Region) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

pub const GIC_DIST: Region =
    Region::fixed("gic-dist", 0x0800_0000, 0x1_0000, MemoryClass::Device, Permissions::ReadWrite);
pub const GIC_CPU: Region =
    Region::fixed("gic-cpu", 0x0801_0000, 0x1_0000, MemoryClass::Device, Permissions::ReadWrite);
pub const UART: Region =
    Region::fixed("uart", 0x0900_0000, 0x1000, MemoryClass::Device, Permissions::ReadWrite);
pub const KERNEL_TEXT: Region = Region::fixed(
    "kernel-text",
    0x4008_0000,
    0x38_0000,
    MemoryClass::Normal,
    Permissions::ReadExecute,
);
pub const KERNEL_DATA: Region = Region::fixed(
    "kernel-data",
    0x4040_0000,
    0x40_0000,
    MemoryClass::Normal,
    Permissions::ReadWrite,
);
// 0x4080_0000..0x4081_0000 stays unmapped below the boot stack.
pub const BOOT_STACK: Region = Region::fixed(
    "boot-stack",
    0x4081_0000,
    0x7_0000,
    MemoryClass::Normal,
    Permissions::ReadWrite,
);
// 0x4088_0000..0x4090_0000 stays unmapped so a boot stack overrun faults.
pub const EXCEPTION_STACK: Region = Region::fixed(
    "exception-stack",
    0x4090_0000,
    0x4_0000,
    MemoryClass::Normal,
    Permissions::ReadWrite,
);
pub const KERNEL_HEAP: Region = Region::fixed(
    "kernel-heap",
    0x40a0_0000,
    0x100_0000,
    MemoryClass::Normal,
    Permissions::ReadWrite,
);
pub const PAGE_TABLES: Region = Region::fixed(
    "page-tables",
    0x41a0_0000,
    0x200_0000,
    MemoryClass::Normal,
    Permissions::ReadWrite,
);
pub const FRAME_POOL: Region = Region {
    name: "frame-pool",
    base: 0x4400_0000,
    size: 0x3c00_0000,
    class: MemoryClass::Normal,
    perms: Permissions::ReadWrite,
    backing: Backing::FramePool,
};
pub const MMAP_BUMP: Region = Region {
    name: "mmap-bump",
    base: 0x4800_0000,
    size: 0x8000_0000,
    class: MemoryClass::Normal,
    perms: Permissions::ReadWrite,
    backing: Backing::Demand,
};

/// Top of the boot stack reserved for the initial process image built by the loader.
/// `_start` points `sp` just below it.
pub const ARG_AREA: usize = 0x1_0000;

/// Lowest address the fault handler will populate.
pub const DEMAND_FLOOR: usize = MMAP_BUMP.base;
/// First address past the demand window (128 TiB, within the 48-bit VA space).
pub const DEMAND_CEILING: usize = 0x8000_0000_0000;

/// The complete memory map, in ascending physical order of the fixed part.
pub static MEMORY_MAP: [Region; 11] = [
    GIC_DIST,
    GIC_CPU,
    UART,
    KERNEL_TEXT,
    KERNEL_DATA,
    BOOT_STACK,
    EXCEPTION_STACK,
    KERNEL_HEAP,
    PAGE_TABLES,
    FRAME_POOL,
    MMAP_BUMP,
];

/// Looks a region up by name.
pub fn region(name: &str) -> Option<&'static Region> {
    MEMORY_MAP.iter().find(|r| r.name == name)
}

/// Iterates the regions that must be mapped before translation is enabled.
pub fn fixed_regions() -> impl Iterator<Item = &'static Region> {
    MEMORY_MAP.iter().filter(|r| r.backing == Backing::Fixed)
}
