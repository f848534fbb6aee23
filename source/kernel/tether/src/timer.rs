// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Periodic tick on the EL1 virtual timer.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::aarch64;
use crate::determinism;
use crate::hal::virt::VirtTimer;

/// Current period in counter ticks; zero until [`start`] runs.
static PERIOD_TICKS: AtomicU64 = AtomicU64::new(0);
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Programs the first expiry `period` ticks from now.
pub fn arm(period: u64) {
    let period = period.max(1);
    PERIOD_TICKS.store(period, Ordering::Relaxed);
    aarch64::virtual_timer_program(period);
}

/// Starts the tick using the configured period.
pub fn start() {
    arm(VirtTimer::ns_to_ticks(determinism::tick_period_ns()));
}

/// Re-programs the next expiry; called first thing on every timer interrupt.
pub fn rearm() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    let period = PERIOD_TICKS.load(Ordering::Relaxed);
    if period != 0 {
        aarch64::virtual_timer_program(period);
    }
}

pub fn stop() {
    PERIOD_TICKS.store(0, Ordering::Relaxed);
    aarch64::virtual_timer_stop();
}

/// Timer interrupts taken since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub fn period_ticks() -> u64 {
    PERIOD_TICKS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_period_is_one_millisecond_of_counter() {
        let expected = aarch64::DEFAULT_COUNTER_HZ / 1_000;
        assert_eq!(VirtTimer::ns_to_ticks(1_000_000), expected);
    }

    #[test]
    fn rearm_reprograms_the_same_period() {
        arm(62_500);
        let before = ticks();
        rearm();
        assert!(ticks() > before);
        assert_eq!(aarch64::host_timer_tval(), 62_500);
        assert_eq!(period_ticks(), 62_500);
    }
}
