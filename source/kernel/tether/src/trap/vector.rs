// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Architectural layout of the EL1 vector table.

use static_assertions::const_assert_eq;

/// VBAR_EL1 bits [10:0] are RES0.
pub const VECTOR_ALIGN: usize = 2048;
/// Bytes reserved for each entry.
pub const SLOT_SIZE: usize = 128;
/// Four groups of synchronous, IRQ, FIQ and SError entries.
pub const SLOT_COUNT: usize = 16;
pub const TABLE_SIZE: usize = SLOT_SIZE * SLOT_COUNT;

const_assert_eq!(TABLE_SIZE, VECTOR_ALIGN);

/// Which stack pointer and execution state the exception came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    CurrentSp0 = 0,
    CurrentSpx = 1,
    LowerAarch64 = 2,
    LowerAarch32 = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Sync = 0,
    Irq = 1,
    Fiq = 2,
    SError = 3,
}

/// Offset of the entry for `(origin, kind)` from the table base.
pub const fn slot_offset(origin: Origin, kind: Kind) -> usize {
    (origin as usize * 4 + kind as usize) * SLOT_SIZE
}

/// Returns `true` for the two entries that do real work; every other slot parks the core.
pub const fn is_handled(origin: Origin, kind: Kind) -> bool {
    matches!((origin, kind), (Origin::CurrentSpx, Kind::Sync) | (Origin::CurrentSpx, Kind::Irq))
}

const ORIGINS: [Origin; 4] = [Origin::CurrentSp0, Origin::CurrentSpx, Origin::LowerAarch64, Origin::LowerAarch32];
const KINDS: [Kind; 4] = [Kind::Sync, Kind::Irq, Kind::Fiq, Kind::SError];

/// Destination of the unconditional `b` encoded in `word` when it sits at `at`.
pub const fn branch_target(at: usize, word: u32) -> Option<usize> {
    if word >> 26 != 0b000101 {
        return None;
    }
    // imm26, sign-extended, in instructions.
    let imm = ((word << 6) as i32 >> 6) as isize * 4;
    Some(at.wrapping_add_signed(imm))
}

/// Where the slots of a correctly built table branch to.
#[derive(Clone, Copy, Debug)]
pub struct SlotTargets {
    pub sync: usize,
    pub irq: usize,
    pub park: usize,
}

impl SlotTargets {
    const fn expected(&self, origin: Origin, kind: Kind) -> usize {
        match (origin, kind) {
            (Origin::CurrentSpx, Kind::Sync) => self.sync,
            (Origin::CurrentSpx, Kind::Irq) => self.irq,
            _ => self.park,
        }
    }
}

/// Checks that each slot's first instruction branches where it should.
///
/// On a mismatch returns the slot offset and the decoded destination.
pub fn check_slots(
    base: usize,
    read_word: impl Fn(usize) -> u32,
    targets: &SlotTargets,
) -> Result<(), (usize, Option<usize>)> {
    for origin in ORIGINS {
        for kind in KINDS {
            let offset = slot_offset(origin, kind);
            let at = base + offset;
            let found = branch_target(at, read_word(at));
            let expected = targets.expected(origin, kind);
            debug_assert_eq!(is_handled(origin, kind), expected != targets.park);
            if found != Some(expected) {
                return Err((offset, found));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec;

    use super::*;

    /// `b` from `at` to `to`.
    fn branch(at: usize, to: usize) -> u32 {
        let delta = (to as isize - at as isize) / 4;
        (0b000101 << 26) | (delta as u32 & 0x03ff_ffff)
    }

    const TARGETS: SlotTargets = SlotTargets { sync: 0x1_0000, irq: 0x1_0040, park: 0x0_0800 };

    fn built_table(base: usize) -> alloc::vec::Vec<u32> {
        let mut words = vec![0u32; TABLE_SIZE / 4];
        for origin in ORIGINS {
            for kind in KINDS {
                let offset = slot_offset(origin, kind);
                words[offset / 4] = branch(base + offset, TARGETS.expected(origin, kind));
            }
        }
        words
    }

    #[test]
    fn branch_decoding_handles_both_directions() {
        assert_eq!(branch_target(0x1000, branch(0x1000, 0x2000)), Some(0x2000));
        assert_eq!(branch_target(0x2000, branch(0x2000, 0x1000)), Some(0x1000));
        // `bl` is not a plain branch.
        assert_eq!(branch_target(0x1000, 0x9400_0001), None);
    }

    #[test]
    fn correctly_wired_table_passes() {
        let base = 0x8000;
        let words = built_table(base);
        assert_eq!(check_slots(base, |at| words[(at - base) / 4], &TARGETS), Ok(()));
    }

    #[test]
    fn miswired_slot_is_reported() {
        let base = 0x8000;
        let mut words = built_table(base);
        let irq = slot_offset(Origin::CurrentSpx, Kind::Irq);
        words[irq / 4] = branch(base + irq, TARGETS.park);
        assert_eq!(check_slots(base, |at| words[(at - base) / 4], &TARGETS), Err((irq, Some(TARGETS.park))));

        words[irq / 4] = 0xd503_205f;
        assert_eq!(check_slots(base, |at| words[(at - base) / 4], &TARGETS), Err((irq, None)));
    }

    #[test]
    fn handled_slots_sit_at_architectural_offsets() {
        assert_eq!(slot_offset(Origin::CurrentSpx, Kind::Sync), 0x200);
        assert_eq!(slot_offset(Origin::CurrentSpx, Kind::Irq), 0x280);
        assert_eq!(slot_offset(Origin::LowerAarch32, Kind::SError), 0x780);
    }

    #[test]
    fn slots_are_128_apart() {
        let origins = [Origin::CurrentSp0, Origin::CurrentSpx, Origin::LowerAarch64, Origin::LowerAarch32];
        let kinds = [Kind::Sync, Kind::Irq, Kind::Fiq, Kind::SError];
        let mut last = None;
        let mut handled = 0;
        for origin in origins {
            for kind in kinds {
                let off = slot_offset(origin, kind);
                if let Some(prev) = last {
                    assert_eq!(off - prev, SLOT_SIZE);
                }
                last = Some(off);
                handled += usize::from(is_handled(origin, kind));
            }
        }
        assert_eq!(last, Some(TABLE_SIZE - SLOT_SIZE));
        assert_eq!(handled, 2);
    }
}
