// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic tuning knobs shared across the kernel
//! OWNERS: @kernel-team
//! PUBLIC API: seed(), set_seed(), tick_period_ns(), set_tick_period_ns(), quantum_ns(), set_quantum_ns()
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: Relaxed atomics sufficient; default values stable across boots
//!
//! The tick period drives how often the preemption injector runs; the quantum
//! is how long a context may run before the injector diverts it. The seed salts
//! `getrandom`, which mixes it with the counter so output still differs per call.

use core::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_SEED: u64 = 0x7465_7468_6572; // ASCII "tether"
const DEFAULT_TICK_NS: u64 = 1_000_000; // 1 ms
const DEFAULT_QUANTUM_NS: u64 = 10_000_000; // 10 ms

static SEED: AtomicU64 = AtomicU64::new(DEFAULT_SEED);
static TICK_PERIOD_NS: AtomicU64 = AtomicU64::new(DEFAULT_TICK_NS);
static QUANTUM_NS: AtomicU64 = AtomicU64::new(DEFAULT_QUANTUM_NS);

/// Returns the entropy salt.
#[inline]
pub fn seed() -> u64 {
    SEED.load(Ordering::Relaxed)
}

/// Overrides the entropy salt.
#[inline]
pub fn set_seed(value: u64) {
    SEED.store(value, Ordering::Relaxed);
}

/// Timer tick period in nanoseconds.
#[inline]
pub fn tick_period_ns() -> u64 {
    TICK_PERIOD_NS.load(Ordering::Relaxed)
}

/// Overrides the tick period; zero is clamped to 1 µs.
#[inline]
pub fn set_tick_period_ns(value: u64) {
    TICK_PERIOD_NS.store(value.max(1_000), Ordering::Relaxed);
}

/// Scheduling quantum in nanoseconds.
#[inline]
pub fn quantum_ns() -> u64 {
    QUANTUM_NS.load(Ordering::Relaxed)
}

/// Overrides the scheduling quantum.
#[inline]
pub fn set_quantum_ns(value: u64) {
    QUANTUM_NS.store(value, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_roundtrip() {
        let before = seed();
        set_seed(42);
        assert_eq!(seed(), 42);
        set_seed(before);
    }

    #[test]
    fn tick_is_never_zero() {
        let before = tick_period_ns();
        set_tick_period_ns(0);
        assert_eq!(tick_period_ns(), 1_000);
        set_tick_period_ns(before);
    }

    #[test]
    fn defaults_keep_quantum_above_tick() {
        assert!(DEFAULT_QUANTUM_NS > DEFAULT_TICK_NS);
    }
}
