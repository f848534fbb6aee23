// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Register snapshot shared by the synchronous, IRQ and preemption paths.
//!
//! The assembly never hard-codes an offset; every field position reaches
//! `trap.S` as a `const` operand computed from this definition.

use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert_eq;

/// Saved register state for an EL1 exception or an injected preemption.
///
/// Must match the `SAVE_CORE`/`RESTORE_CORE` macros in `arch/aarch64/trap.S`.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    /// x0..x30.
    pub x: [u64; 31],
    /// Stack pointer of the interrupted code.
    pub sp: u64,
    pub elr: u64,
    pub spsr: u64,
    pub far: u64,
    pub esr: u64,
    pub fpsr: u64,
    pub fpcr: u64,
    /// Condition flags at entry, split out of SPSR for diagnostics.
    pub nzcv: u64,
    pub(crate) _pad: u64,
    /// q0..q31.
    pub q: [u128; 32],
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            elr: 0,
            spsr: 0,
            far: 0,
            esr: 0,
            fpsr: 0,
            fpcr: 0,
            nzcv: 0,
            _pad: 0,
            q: [0; 32],
        }
    }
}

impl TrapFrame {
    /// Syscall number register (`x8`).
    #[inline]
    pub fn syscall_number(&self) -> usize {
        self.x[8] as usize
    }

    /// Syscall arguments `x0..x5`.
    #[inline]
    pub fn syscall_args(&self) -> [usize; 6] {
        let x = &self.x;
        [x[0] as usize, x[1] as usize, x[2] as usize, x[3] as usize, x[4] as usize, x[5] as usize]
    }

    /// Stores a syscall result in `x0`.
    #[inline]
    pub fn set_return(&mut self, value: usize) {
        self.x[0] = value as u64;
    }
}

pub const TF_SIZE: usize = size_of::<TrapFrame>();
pub const TF_SP: usize = offset_of!(TrapFrame, sp);
pub const TF_ELR: usize = offset_of!(TrapFrame, elr);
pub const TF_FAR: usize = offset_of!(TrapFrame, far);
pub const TF_FPSR: usize = offset_of!(TrapFrame, fpsr);
pub const TF_NZCV: usize = offset_of!(TrapFrame, nzcv);
pub const TF_Q: usize = offset_of!(TrapFrame, q);

// The assembly stores these pairs with single `stp`/`ldp` instructions.
const_assert_eq!(offset_of!(TrapFrame, spsr), TF_ELR + 8);
const_assert_eq!(offset_of!(TrapFrame, esr), TF_FAR + 8);
const_assert_eq!(offset_of!(TrapFrame, fpcr), TF_FPSR + 8);
const_assert_eq!(TF_Q % 16, 0);
const_assert_eq!(TF_SIZE % 16, 0);
const_assert_eq!(TF_SIZE, 832);

/// Scratch record used by the vector entry before a frame exists.
///
/// Valid only between vector entry and completion of frame construction; the
/// entry code refuses to run while `building` is set.
#[repr(C)]
pub struct TrapHandoff {
    pub x0: u64,
    pub x1: u64,
    pub sp: u64,
    pub building: u64,
    /// GICC_IAR value read on IRQ entry before the frame is saved.
    pub iar: u64,
}

pub const HO_X0: usize = offset_of!(TrapHandoff, x0);
pub const HO_X1: usize = offset_of!(TrapHandoff, x1);
pub const HO_SP: usize = offset_of!(TrapHandoff, sp);
pub const HO_BUILDING: usize = offset_of!(TrapHandoff, building);
pub const HO_IAR: usize = offset_of!(TrapHandoff, iar);

const_assert_eq!(HO_X1, HO_X0 + 8);

/// The one handoff record, addressed by symbol from `trap.S`.
#[no_mangle]
pub static mut TRAP_HANDOFF: TrapHandoff = TrapHandoff { x0: 0, x1: 0, sp: 0, building: 0, iar: 0 };

/// `[lo, hi)` of the stack the next trap frame is built on.
///
/// Every context owns one; the vector entry moves there unless the
/// interrupted `sp` already lies inside it. Only changed with IRQs masked.
#[repr(C)]
pub struct TrapStack {
    pub lo: AtomicU64,
    pub hi: AtomicU64,
}

pub const TS_LO: usize = offset_of!(TrapStack, lo);
pub const TS_HI: usize = offset_of!(TrapStack, hi);

const_assert_eq!(size_of::<AtomicU64>(), size_of::<u64>());

/// Starts out as the fixed exception stack, which the root context keeps.
#[no_mangle]
pub static TRAP_STACK: TrapStack = TrapStack {
    lo: AtomicU64::new(crate::mm::layout::EXCEPTION_STACK.base as u64),
    hi: AtomicU64::new(crate::mm::layout::EXCEPTION_STACK.end() as u64),
};

/// Points the vector entry at the trap stack of the context about to run.
pub fn set_trap_stack(lo: usize, hi: usize) {
    TRAP_STACK.lo.store(lo as u64, Ordering::Relaxed);
    TRAP_STACK.hi.store((hi & !0xf) as u64, Ordering::Release);
}

/// Current trap stack bounds.
pub fn trap_stack() -> (usize, usize) {
    (TRAP_STACK.lo.load(Ordering::Relaxed) as usize, TRAP_STACK.hi.load(Ordering::Acquire) as usize)
}
