// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Timer-driven preemption injector
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Preemptor, PreemptDecision, init(), on_timer_irq(), disable(), PreemptGuard
//! DEPENDS_ON: timer (re-arm), sched::yield_now (trampoline hook), arch::aarch64 (counter)
//! INVARIANTS: The timer is re-armed before any decision; at most one stash is armed;
//!             the trampoline never preempts itself; no injection while a disabled region is open
//!
//! The IRQ handler never switches stacks. When a context has used up its
//! quantum the handler stashes the interrupted `elr`/`spsr`, points `elr` at
//! `__preempt_trampoline` and masks IRQs in the saved `spsr`. The exception
//! return then lands in the trampoline, which saves a full frame on the
//! context's trap stack (the interrupted stack is left untouched), consumes the
//! stash and yields.

use core::ops::Range;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::arch::aarch64;
use crate::trap::TrapFrame;

/// PSTATE.I in a saved SPSR.
pub const SPSR_IRQ_MASK: u64 = 1 << 7;

/// Interrupted state held between the IRQ handler and the trampoline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stash {
    pub elr: u64,
    pub spsr: u64,
}

/// Outcome of one timer tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreemptDecision {
    /// Quantum not yet used up.
    NotDue,
    /// Injector not started or a preemption-disabled region is open.
    Disabled,
    /// The tick interrupted the trampoline itself.
    InTrampoline,
    /// A previous injection has not been consumed yet.
    AlreadyArmed,
    /// `elr` now points at the trampoline.
    Injected,
}

/// Quantum bookkeeping and the single stash slot.
#[derive(Debug)]
pub struct Preemptor {
    enabled: bool,
    quantum_ticks: u64,
    slice_start: u64,
    injected: u64,
    stash: Option<Stash>,
}

impl Preemptor {
    pub const fn new(quantum_ticks: u64) -> Self {
        Self { enabled: false, quantum_ticks, slice_start: 0, injected: 0, stash: None }
    }

    pub fn start(&mut self, quantum_ticks: u64, now: u64) {
        self.quantum_ticks = quantum_ticks;
        self.slice_start = now;
        self.enabled = true;
    }

    pub fn stop(&mut self) {
        self.enabled = false;
    }

    /// Decides whether the interrupted code gets diverted into the trampoline.
    pub fn on_tick(
        &mut self,
        frame: &mut TrapFrame,
        now: u64,
        trampoline: Range<u64>,
        disabled_regions: u32,
    ) -> PreemptDecision {
        if !self.enabled || disabled_regions > 0 {
            return PreemptDecision::Disabled;
        }
        if trampoline.contains(&frame.elr) {
            return PreemptDecision::InTrampoline;
        }
        if self.stash.is_some() {
            return PreemptDecision::AlreadyArmed;
        }
        if now.wrapping_sub(self.slice_start) < self.quantum_ticks {
            return PreemptDecision::NotDue;
        }
        self.stash = Some(Stash { elr: frame.elr, spsr: frame.spsr });
        frame.elr = trampoline.start;
        frame.spsr |= SPSR_IRQ_MASK;
        self.injected += 1;
        self.slice_start = now;
        PreemptDecision::Injected
    }

    /// Hands the stash to the trampoline, leaving the slot empty.
    pub fn take_stash(&mut self) -> Option<Stash> {
        self.stash.take()
    }

    /// Starts a fresh quantum for whichever context runs next.
    pub fn reset_slice(&mut self, now: u64) {
        self.slice_start = now;
    }

    pub fn injected(&self) -> u64 {
        self.injected
    }

    pub fn is_armed(&self) -> bool {
        self.stash.is_some()
    }
}

static PREEMPT: Mutex<Preemptor> = Mutex::new(Preemptor::new(0));
static DISABLE_DEPTH: AtomicU32 = AtomicU32::new(0);
static INJECTIONS: AtomicU64 = AtomicU64::new(0);

/// Keeps the injector away while alive. Nests.
#[must_use = "preemption is re-enabled when the guard drops"]
pub struct PreemptGuard {
    _private: (),
}

/// Opens a preemption-disabled region, for code that holds locks a yield could deadlock on.
pub fn disable() -> PreemptGuard {
    DISABLE_DEPTH.fetch_add(1, Ordering::Acquire);
    PreemptGuard { _private: () }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        DISABLE_DEPTH.fetch_sub(1, Ordering::Release);
    }
}

pub fn disabled_depth() -> u32 {
    DISABLE_DEPTH.load(Ordering::Relaxed)
}

/// Total injections since boot.
pub fn injections() -> u64 {
    INJECTIONS.load(Ordering::Relaxed)
}

/// Enables injection with the configured quantum.
pub fn init() {
    let quantum = crate::hal::virt::VirtTimer::ns_to_ticks(crate::determinism::quantum_ns());
    PREEMPT.lock().start(quantum, aarch64::counter());
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
extern "C" {
    static __preempt_trampoline: u8;
    static __preempt_trampoline_end: u8;
}

/// Address range of the trampoline code.
pub fn trampoline_range() -> Range<u64> {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        // SAFETY: only the symbol addresses are taken.
        unsafe {
            core::ptr::addr_of!(__preempt_trampoline) as u64
                ..core::ptr::addr_of!(__preempt_trampoline_end) as u64
        }
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        0..0
    }
}

/// Timer PPI handler.
pub fn on_timer_irq(frame: &mut TrapFrame) {
    crate::timer::rearm();
    let now = aarch64::counter();
    // The trampoline holds this lock briefly with IRQs masked, so contention means
    // we interrupted ourselves; skip this tick.
    let Some(mut preemptor) = PREEMPT.try_lock() else {
        return;
    };
    let decision = preemptor.on_tick(frame, now, trampoline_range(), disabled_depth());
    if decision == PreemptDecision::Injected {
        INJECTIONS.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "debug_uart")]
        crate::log_trace!(target: "preempt", "inject elr=0x{:x}", preemptor.stash.map_or(0, |s| s.elr));
    }
}

#[no_mangle]
extern "C" fn __preempt_take_stash(frame: &mut TrapFrame) {
    match PREEMPT.lock().take_stash() {
        Some(stash) => {
            frame.elr = stash.elr;
            frame.spsr = stash.spsr;
        }
        None => {
            use core::fmt::Write as _;
            let mut u = crate::uart::raw_writer();
            let _ = write!(u, "FATAL: preemption trampoline entered without a stash\n");
            aarch64::halt();
        }
    }
}

#[no_mangle]
extern "C" fn __preempt_yield(_frame: &mut TrapFrame) {
    crate::sched::yield_now();
    PREEMPT.lock().reset_slice(aarch64::counter());
}
