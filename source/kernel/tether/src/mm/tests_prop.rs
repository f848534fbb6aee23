// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property tests for the bump allocator and the demand-fault path
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only

use proptest::prelude::*;

use super::tests::test_space;
use super::{BumpAllocator, FaultOutcome, PAGE_SIZE};

proptest! {
    #[test]
    fn hintless_allocations_are_increasing_aligned_and_disjoint(
        sizes in proptest::collection::vec(1usize..=64 * 1024, 1..48)
    ) {
        let mut bump = BumpAllocator::new(0x4800_0000, 0xc800_0000);
        let mut prev_end = 0usize;
        for size in sizes {
            let base = bump.alloc(size).expect("within bound");
            prop_assert_eq!(base % PAGE_SIZE, 0);
            prop_assert!(base >= prev_end);
            prev_end = base + size;
            prop_assert_eq!(bump.cursor() % PAGE_SIZE, 0);
            prop_assert!(bump.cursor() >= prev_end);
        }
    }

    #[test]
    fn every_resolved_fault_maps_its_page_exactly_once(
        pages in proptest::collection::vec(0usize..512, 1..32)
    ) {
        let mut space = test_space(512);
        let mut fresh = 0u64;
        for page in pages {
            let addr = 0x4000_0000_0000 + page * PAGE_SIZE + 8;
            match space.handle_fault(addr) {
                Ok(FaultOutcome::Mapped { page: p, .. }) => {
                    fresh += 1;
                    prop_assert_eq!(p, addr & !(PAGE_SIZE - 1));
                }
                Ok(FaultOutcome::AlreadyMapped { .. }) => {}
                Err(err) => {
                    // Only the repeated-fault guard may refuse an in-window address.
                    let is_repeated = matches!(err, super::FaultError::Repeated { .. });
                    prop_assert!(is_repeated);
                }
            }
            prop_assert!(space.translate(addr).is_some());
        }
        prop_assert_eq!(space.resolved_faults(), fresh);
        prop_assert_eq!(space.frames().allocated() as u64, fresh);
        prop_assert_eq!(space.mmu().invalidated.borrow().len() as u64, fresh);
    }
}
