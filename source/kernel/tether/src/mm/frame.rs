// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frame sources: the demand-paging frame pool and the page-table region.

use core::ptr::NonNull;

use super::layout::Region;
use super::page_table::{TableAlloc, TablePage};
use super::PAGE_SIZE;

/// Bump pool of 4 KiB physical frames. Frames are never returned.
#[derive(Debug)]
pub struct FramePool {
    cursor: usize,
    base: usize,
    limit: usize,
}

impl FramePool {
    pub const fn new(base: usize, limit: usize) -> Self {
        Self { cursor: base, base, limit }
    }

    pub const fn from_region(region: &Region) -> Self {
        Self::new(region.base, region.end())
    }

    /// Hands out the next frame, or `None` once the pool ceiling is reached.
    pub fn alloc_frame(&mut self) -> Option<usize> {
        if self.cursor + PAGE_SIZE > self.limit {
            return None;
        }
        let pa = self.cursor;
        self.cursor += PAGE_SIZE;
        Some(pa)
    }

    /// Frames handed out so far.
    pub fn allocated(&self) -> usize {
        (self.cursor - self.base) / PAGE_SIZE
    }

    /// Frames still available.
    pub fn remaining(&self) -> usize {
        (self.limit - self.cursor) / PAGE_SIZE
    }
}

/// Table pages carved from the identity-mapped `page-tables` region.
pub struct RegionTables {
    cursor: usize,
    limit: usize,
}

impl RegionTables {
    /// # Safety
    ///
    /// `region` must be RAM that nothing else uses and that stays identity
    /// mapped for the lifetime of the kernel.
    pub const unsafe fn new(region: &Region) -> Self {
        Self { cursor: region.base, limit: region.end() }
    }
}

impl TableAlloc for RegionTables {
    fn alloc_table(&mut self) -> Option<NonNull<TablePage>> {
        if self.cursor + PAGE_SIZE > self.limit {
            return None;
        }
        let page = self.cursor as *mut TablePage;
        self.cursor += PAGE_SIZE;
        // SAFETY: the constructor contract gives us exclusive use of this page.
        unsafe { core::ptr::write_bytes(page, 0, 1) };
        NonNull::new(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_distinct_aligned_frames_until_ceiling() {
        let mut pool = FramePool::new(0x4400_0000, 0x4400_3000);
        let a = pool.alloc_frame();
        let b = pool.alloc_frame();
        let c = pool.alloc_frame();
        assert_eq!((a, b, c), (Some(0x4400_0000), Some(0x4400_1000), Some(0x4400_2000)));
        assert_eq!(pool.alloc_frame(), None);
        assert_eq!(pool.allocated(), 3);
        assert_eq!(pool.remaining(), 0);
    }
}
