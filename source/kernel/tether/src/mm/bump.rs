// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual bump allocator backing hint-less `mmap`.

use core::fmt;

use super::{align_up, layout::Region, PAGE_SIZE};

/// Error returned by [`BumpAllocator::alloc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BumpError {
    /// The request does not fit below the bound.
    OutOfMemory,
}

impl fmt::Display for BumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bump region exhausted")
    }
}

/// Monotonic cursor over `[cursor, bound)`.
///
/// The cursor is page aligned after every allocation, never decreases and
/// never passes `bound`. Nothing is ever reclaimed.
#[derive(Debug)]
pub struct BumpAllocator {
    cursor: usize,
    bound: usize,
}

impl BumpAllocator {
    pub const fn new(start: usize, bound: usize) -> Self {
        Self { cursor: align_up(start, PAGE_SIZE), bound }
    }

    pub const fn from_region(region: &Region) -> Self {
        Self::new(region.base, region.end())
    }

    /// Reserves `len` bytes rounded up to whole pages and returns the base.
    pub fn alloc(&mut self, len: usize) -> Result<usize, BumpError> {
        let rounded = len
            .checked_add(PAGE_SIZE - 1)
            .map(|v| v & !(PAGE_SIZE - 1))
            .ok_or(BumpError::OutOfMemory)?;
        let end = self.cursor.checked_add(rounded).ok_or(BumpError::OutOfMemory)?;
        if end > self.bound {
            return Err(BumpError::OutOfMemory);
        }
        let base = self.cursor;
        self.cursor = end;
        Ok(base)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn bound(&self) -> usize {
        self.bound
    }
}
