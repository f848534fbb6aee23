// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Tests pinning the Linux/AArch64 constants the hosted runtime relies on
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 4 integration tests
//!
//! TEST_SCOPE:
//!   - Syscall numbers of the generic arm64 table
//!   - errno encoding in x0
//!   - timespec conversion from counter ticks
//!
//! TEST_SCENARIOS:
//!   - syscall_numbers_match_arm64(): numbers used by runtime stubs
//!   - errno_values_match_linux(): errno constants
//!   - timespec_splits_seconds_and_nanos(): integer conversion at 62.5 MHz
//!   - timespec_handles_zero_frequency(): degenerate counter
//!
//! DEPENDENCIES:
//!   - tether_abi::{nr, errno, Timespec}
use tether_abi::{errno, nr, Timespec, NSEC_PER_SEC};

#[test]
fn syscall_numbers_match_arm64() {
    assert_eq!(nr::WRITE, 64);
    assert_eq!(nr::FUTEX, 98);
    assert_eq!(nr::CLOCK_GETTIME, 113);
    assert_eq!(nr::CLONE, 220);
    assert_eq!(nr::MMAP, 222);
    assert_eq!(nr::GETRANDOM, 278);
}

#[test]
fn errno_values_match_linux() {
    assert_eq!(errno::EAGAIN, 11);
    assert_eq!(errno::ENOMEM, 12);
    assert_eq!(errno::ENOSYS, 38);
}

#[test]
fn timespec_splits_seconds_and_nanos() {
    let freq = 62_500_000;
    let ts = Timespec::from_ticks(freq * 3 + freq / 4, freq);
    assert_eq!(ts.tv_sec, 3);
    assert_eq!(ts.tv_nsec, 250_000_000);
    assert!((ts.tv_nsec as u64) < NSEC_PER_SEC);
    assert_eq!(ts.as_nanos(), 3_250_000_000);
}

#[test]
fn timespec_handles_zero_frequency() {
    assert_eq!(Timespec::from_ticks(12345, 0), Timespec::default());
}
