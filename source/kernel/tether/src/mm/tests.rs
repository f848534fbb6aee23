// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unit tests for page-table invariants and the demand-fault path
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; table pages come from the host heap, frames are fake physical addresses

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::ptr::NonNull;

use super::address_space::MAX_REPEATED_FAULTS;
use super::page_table::TablePage;
use super::{
    AddressSpace, DemandWindow, FaultError, FaultOutcome, FramePool, MapError, MemoryClass,
    PageFlags, PageTable, Permissions, TableAlloc, BLOCK_SIZE, PAGE_SIZE,
};
use crate::hal::Mmu;

/// Heap-backed table pages; leaked for the duration of the test process.
#[derive(Default)]
pub(crate) struct HeapTables {
    pub handed_out: usize,
}

impl TableAlloc for HeapTables {
    fn alloc_table(&mut self) -> Option<NonNull<TablePage>> {
        self.handed_out += 1;
        NonNull::new(Box::into_raw(Box::new(TablePage::new())))
    }
}

/// Records maintenance operations instead of executing them.
#[derive(Default)]
pub(crate) struct RecordingMmu {
    pub invalidated: RefCell<Vec<usize>>,
    pub zeroed: RefCell<Vec<usize>>,
    pub flushes: RefCell<usize>,
}

impl Mmu for RecordingMmu {
    fn invalidate_page(&self, va: usize) {
        self.invalidated.borrow_mut().push(va);
    }

    fn invalidate_all(&self) {
        *self.flushes.borrow_mut() += 1;
    }

    unsafe fn zero_page(&self, va: usize) {
        self.zeroed.borrow_mut().push(va);
    }
}

const FLOOR: usize = 0x4800_0000;

pub(crate) fn test_space(frames: usize) -> AddressSpace<HeapTables, RecordingMmu> {
    let pool = FramePool::new(0x4400_0000, 0x4400_0000 + frames * PAGE_SIZE);
    let window = DemandWindow { floor: FLOOR, ceiling: 0x8000_0000_0000 };
    match AddressSpace::new(HeapTables::default(), pool, RecordingMmu::default(), window) {
        Ok(space) => space,
        Err(err) => panic!("address space: {err}"),
    }
}

fn rw() -> PageFlags {
    PageFlags::leaf(Permissions::ReadWrite, MemoryClass::Normal)
}

#[test]
fn rejects_unaligned_addresses() {
    let mut table = PageTable::new(HeapTables::default()).expect("root");
    assert_eq!(table.map_page(1, PAGE_SIZE, rw()), Err(MapError::Unaligned));
    assert_eq!(table.map_page(0, 1, rw()), Err(MapError::Unaligned));
    assert_eq!(table.map_block(PAGE_SIZE, 0, rw()), Err(MapError::Unaligned));
}

#[test]
fn rejects_invalid_flags() {
    let mut table = PageTable::new(HeapTables::default()).expect("root");
    assert_eq!(table.map_page(0, 0, PageFlags::empty()), Err(MapError::InvalidFlags));
    assert_eq!(table.map_page(0, 0, PageFlags::VALID), Err(MapError::InvalidFlags));
}

#[test]
fn enforces_w_xor_x() {
    let mut table = PageTable::new(HeapTables::default()).expect("root");
    let wx = PageFlags::VALID | PageFlags::ACCESSED;
    assert_eq!(table.map_page(0, 0, wx), Err(MapError::PermissionDenied));
}

#[test]
fn detects_overlap() {
    let mut table = PageTable::new(HeapTables::default()).expect("root");
    table.map_page(0x1000, 0x8000, rw()).expect("first mapping");
    assert_eq!(table.map_page(0x1000, 0x9000, rw()), Err(MapError::Overlap));
    // A block over a range whose level-2 slot already points at a table also collides.
    assert_eq!(table.map_block(0, 0, rw()), Err(MapError::Overlap));
}

#[test]
fn out_of_range_rejected() {
    let mut table = PageTable::new(HeapTables::default()).expect("root");
    assert_eq!(table.map_page(1 << 48, 0, rw()), Err(MapError::OutOfRange));
}

#[test]
fn lookup_observes_page_and_block() {
    let mut table = PageTable::new(HeapTables::default()).expect("root");
    table.map_page(0x4000_0000_0000, 0x4400_0000, rw()).expect("page");
    table.map_block(0x4020_0000, 0x4020_0000, rw()).expect("block");

    let page = table.lookup(0x4000_0000_0123).expect("page leaf");
    assert_eq!(page.pa, 0x4400_0123);
    assert_eq!(page.size, PAGE_SIZE);

    let block = table.lookup(0x4030_1000).expect("block leaf");
    assert_eq!(block.pa, 0x4030_1000);
    assert_eq!(block.size, BLOCK_SIZE);

    assert!(table.lookup(0x4000_0000_1000).is_none());
}

#[test]
fn intermediate_levels_are_shared() {
    let mut table = PageTable::new(HeapTables::default()).expect("root");
    table.map_page(0x4800_0000, 0x4400_0000, rw()).expect("a");
    let after_first = table.table_count();
    table.map_page(0x4800_1000, 0x4400_1000, rw()).expect("b");
    assert_eq!(after_first, 4);
    assert_eq!(table.table_count(), after_first);
}

#[test]
fn device_and_code_attributes() {
    let dev = PageFlags::leaf(Permissions::ReadWrite, MemoryClass::Device);
    assert!(dev.contains(PageFlags::ATTR_DEVICE | PageFlags::PXN | PageFlags::UXN));
    assert!(!dev.contains(PageFlags::SH_INNER));

    let code = PageFlags::leaf(Permissions::ReadExecute, MemoryClass::Normal);
    assert!(code.contains(PageFlags::AP_RO));
    assert!(!code.contains(PageFlags::PXN));
}

#[test]
fn map_fixed_prefers_blocks() {
    let mut space = test_space(0);
    let len = BLOCK_SIZE + 2 * PAGE_SIZE;
    space
        .map_fixed(0x4020_0000, 0x4020_0000, len, Permissions::ReadWrite, MemoryClass::Normal)
        .expect("fixed");
    assert_eq!(space.translate(0x4020_0000 + BLOCK_SIZE - 8), Some(0x4020_0000 + BLOCK_SIZE - 8));
    assert_eq!(space.translate(0x4020_0000 + BLOCK_SIZE + PAGE_SIZE), Some(0x4020_0000 + BLOCK_SIZE + PAGE_SIZE));
    assert_eq!(space.translate(0x4020_0000 + len), None);
}

#[test]
fn fault_maps_one_rw_xn_page_and_invalidates_once() {
    let mut space = test_space(8);
    let outcome = space.handle_fault(0x4800_0123).expect("fault");
    assert_eq!(outcome, FaultOutcome::Mapped { page: 0x4800_0000, frame: 0x4400_0000 });

    let flags = space.flags(0x4800_0000).expect("mapped");
    assert!(flags.contains(PageFlags::PXN | PageFlags::UXN));
    assert!(!flags.contains(PageFlags::AP_RO));
    assert!(!flags.contains(PageFlags::ATTR_DEVICE));

    assert_eq!(*space.mmu().invalidated.borrow(), [0x4800_0000]);
    assert_eq!(*space.mmu().zeroed.borrow(), [0x4800_0000]);
    assert_eq!(*space.mmu().flushes.borrow(), 0);
}

#[test]
fn duplicate_fault_allocates_nothing() {
    let mut space = test_space(8);
    space.handle_fault(0x4000_0000_0000).expect("first");
    let second = space.handle_fault(0x4000_0000_0ff8).expect("second");
    assert_eq!(second, FaultOutcome::AlreadyMapped { page: 0x4000_0000_0000 });
    assert_eq!(space.frames().allocated(), 1);
    assert_eq!(space.resolved_faults(), 1);
    assert_eq!(space.mmu().invalidated.borrow().len(), 1);
}

#[test]
fn faults_outside_window_fail() {
    let mut space = test_space(8);
    assert_eq!(space.handle_fault(0), Err(FaultError::OutsideWindow { addr: 0 }));
    assert_eq!(
        space.handle_fault(FLOOR - 1),
        Err(FaultError::OutsideWindow { addr: FLOOR - 1 })
    );
    assert_eq!(
        space.handle_fault(0x8000_0000_0000),
        Err(FaultError::OutsideWindow { addr: 0x8000_0000_0000 })
    );
    assert_eq!(space.frames().allocated(), 0);
}

#[test]
fn exhausted_pool_reports_out_of_frames() {
    let mut space = test_space(1);
    space.handle_fault(FLOOR).expect("first frame");
    assert_eq!(
        space.handle_fault(FLOOR + PAGE_SIZE),
        Err(FaultError::OutOfFrames { addr: FLOOR + PAGE_SIZE })
    );
}

#[test]
fn repeated_faults_on_one_page_become_fatal() {
    let mut space = test_space(4);
    for _ in 0..MAX_REPEATED_FAULTS {
        assert!(space.handle_fault(FLOOR).is_ok());
    }
    assert_eq!(space.handle_fault(FLOOR), Err(FaultError::Repeated { page: FLOOR }));
    // A different page resets the streak.
    assert!(space.handle_fault(FLOOR + PAGE_SIZE).is_ok());
    assert!(space.handle_fault(FLOOR).is_ok());
}

#[test]
fn loader_pages_take_frames_from_the_pool() {
    let mut space = test_space(2);
    let frame = space.map_fresh_page(0x10000, Permissions::ReadExecute).expect("text page");
    assert_eq!(space.translate(0x10000), Some(frame));
    assert!(space.map_fresh_page(0x10000, Permissions::ReadOnly).is_err());
}

#[test]
fn protect_rewrites_permissions_in_place() {
    let mut space = test_space(2);
    let frame = space.map_fresh_page(0x20000, Permissions::ReadWrite).expect("data page");
    space.protect_page(0x20000, Permissions::ReadExecute).expect("protect");
    let flags = space.flags(0x20000).expect("still mapped");
    assert!(flags.contains(PageFlags::AP_RO));
    assert!(!flags.contains(PageFlags::PXN));
    assert_eq!(space.translate(0x20000), Some(frame));
    assert_eq!(*space.mmu().invalidated.borrow(), [0x20000, 0x20000]);
    assert_eq!(space.protect_page(0x30000, Permissions::ReadOnly), Err(MapError::OutOfRange));
}
