// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Exception dispatch: assembly vector entry plus a safe Rust core
//! OWNERS: @kernel-team
//! PUBLIC API: install(), classify(), ExceptionClass, TrapAction, FatalReason, last_trap(), fmt_trap()
//! DEPENDS_ON: arch::aarch64 (VBAR, halt), mm::resolve_fault, syscall::handle_trap, irq::dispatch, sched::guard_hit
//! INVARIANTS: Trap handlers run with IRQs masked and never unmask; every slot except
//!             current-EL/SPx sync and IRQ parks; fatal traps print through the raw UART and halt

pub mod frame;
pub mod vector;

use core::fmt::{self, Write};

use spin::Mutex;

use crate::arch::aarch64;
use crate::mm::{self, FaultError, FaultOutcome};

pub use frame::{set_trap_stack, trap_stack, TrapFrame, TrapHandoff, TrapStack};

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
core::arch::global_asm!(
    include_str!("../arch/aarch64/trap.S"),
    TF_SIZE = const frame::TF_SIZE,
    TF_SP = const frame::TF_SP,
    TF_ELR = const frame::TF_ELR,
    TF_FAR = const frame::TF_FAR,
    TF_FPSR = const frame::TF_FPSR,
    TF_NZCV = const frame::TF_NZCV,
    TF_Q = const frame::TF_Q,
    HO_X0 = const frame::HO_X0,
    HO_X1 = const frame::HO_X1,
    HO_SP = const frame::HO_SP,
    HO_BUILDING = const frame::HO_BUILDING,
    HO_IAR = const frame::HO_IAR,
    TS_LO = const frame::TS_LO,
    TS_HI = const frame::TS_HI,
    EXC_HI = const mm::layout::EXCEPTION_STACK.base + mm::layout::EXCEPTION_STACK.size,
    GICC_IAR = const mm::layout::GIC_CPU.base + crate::irq::gic::GICC_IAR,
    VEC_ALIGN = const vector::VECTOR_ALIGN,
    SLOT = const vector::SLOT_SIZE,
);

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
extern "C" {
    static __vector_table: u8;
    static __vector_table_end: u8;
    fn __trap_sync_entry();
    fn __trap_irq_entry();
    fn __vector_park();
}

/// Stand-in table so `install` can be exercised on the host.
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
#[repr(C, align(2048))]
struct HostTable([u8; vector::TABLE_SIZE]);

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
static HOST_TABLE: HostTable = HostTable([0; vector::TABLE_SIZE]);

static LAST_TRAP: Mutex<Option<TrapFrame>> = Mutex::new(None);

/// Decoded ESR_EL1.EC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionClass {
    Unknown,
    Svc64,
    InstructionAbortLower,
    InstructionAbortSame,
    DataAbortLower,
    DataAbortSame,
    Other(u8),
}

impl ExceptionClass {
    pub const fn from_esr(esr: u64) -> Self {
        match ((esr >> 26) & 0x3f) as u8 {
            0x00 => Self::Unknown,
            0x15 => Self::Svc64,
            0x20 => Self::InstructionAbortLower,
            0x21 => Self::InstructionAbortSame,
            0x24 => Self::DataAbortLower,
            0x25 => Self::DataAbortSame,
            other => Self::Other(other),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown-instruction",
            Self::Svc64 => "svc64",
            Self::InstructionAbortLower | Self::InstructionAbortSame => "instruction-abort",
            Self::DataAbortLower | Self::DataAbortSame => "data-abort",
            Self::Other(_) => "unhandled",
        }
    }

    const fn is_abort(self) -> bool {
        matches!(
            self,
            Self::InstructionAbortLower
                | Self::InstructionAbortSame
                | Self::DataAbortLower
                | Self::DataAbortSame
        )
    }
}

/// Why a trap cannot be resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalReason {
    UnknownInstruction,
    UnhandledClass(u8),
    /// Permission, alignment or access-flag fault; `status` is the DFSC/IFSC.
    NotTranslation { addr: usize, status: u8 },
    /// FAR_EL1 does not hold the faulting address.
    FarInvalid,
    StackOverflow { addr: usize, context: usize },
    FaultLoop { page: usize },
    Unresolved(FaultError),
    NestedFault,
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownInstruction => f.write_str("undefined instruction"),
            Self::UnhandledClass(ec) => write!(f, "unhandled exception class {:#04x}", ec),
            Self::NotTranslation { addr, status } => {
                write!(f, "non-translation fault status={:#04x} at {:#x}", status, addr)
            }
            Self::FarInvalid => f.write_str("fault address not valid"),
            Self::StackOverflow { addr, context } => {
                write!(f, "stack overflow in context {} at {:#x}", context, addr)
            }
            Self::FaultLoop { page } => write!(f, "fault loop on page {:#x}", page),
            Self::Unresolved(err) => write!(f, "unresolved fault: {}", err),
            Self::NestedFault => f.write_str("fault while building a trap frame"),
        }
    }
}

/// What the synchronous path does with a trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapAction {
    Syscall,
    PageFault { addr: usize },
    Fatal(FatalReason),
}

const ISS_FNV: u64 = 1 << 10;
const FSC_MASK: u64 = 0x3f;
/// Translation fault, levels 0..3.
const FSC_TRANSLATION: u64 = 0b00_0100;

/// Classifies a synchronous exception from its saved syndrome.
pub fn classify(frame: &TrapFrame) -> TrapAction {
    let class = ExceptionClass::from_esr(frame.esr);
    match class {
        ExceptionClass::Svc64 => TrapAction::Syscall,
        ExceptionClass::Unknown => TrapAction::Fatal(FatalReason::UnknownInstruction),
        ExceptionClass::Other(ec) => TrapAction::Fatal(FatalReason::UnhandledClass(ec)),
        _ if class.is_abort() => {
            let status = frame.esr & FSC_MASK;
            if frame.esr & ISS_FNV != 0 {
                TrapAction::Fatal(FatalReason::FarInvalid)
            } else if status & !0b11 == FSC_TRANSLATION {
                TrapAction::PageFault { addr: frame.far as usize }
            } else {
                TrapAction::Fatal(FatalReason::NotTranslation {
                    addr: frame.far as usize,
                    status: status as u8,
                })
            }
        }
        _ => TrapAction::Fatal(FatalReason::UnhandledClass(0)),
    }
}

/// Error returned by [`install`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapError {
    Misaligned { base: usize },
    BadSize { size: usize },
    /// A slot does not branch to its entry; `target` is where it does go.
    SlotMiswired { offset: usize, target: Option<usize> },
    VectorRejected { wrote: usize, read: usize },
}

impl fmt::Display for TrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned { base } => write!(f, "vector table at {:#x} not 2048-aligned", base),
            Self::BadSize { size } => write!(f, "vector table spans {} bytes", size),
            Self::SlotMiswired { offset, target } => {
                write!(f, "vector slot {:#x} branches to {:x?}", offset, target)
            }
            Self::VectorRejected { wrote, read } => {
                write!(f, "VBAR_EL1 read back {:#x} after writing {:#x}", read, wrote)
            }
        }
    }
}

/// Address of the vector table as linked.
pub fn vector_base() -> usize {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        // SAFETY: only the symbol address is taken.
        unsafe { core::ptr::addr_of!(__vector_table) as usize }
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        HOST_TABLE.0.as_ptr() as usize
    }
}

fn vector_end() -> usize {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        // SAFETY: only the symbol address is taken.
        unsafe { core::ptr::addr_of!(__vector_table_end) as usize }
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        vector_base() + vector::TABLE_SIZE
    }
}

fn validate(base: usize, end: usize) -> Result<(), TrapError> {
    if base % vector::VECTOR_ALIGN != 0 {
        return Err(TrapError::Misaligned { base });
    }
    let size = end.wrapping_sub(base);
    if size != vector::TABLE_SIZE {
        return Err(TrapError::BadSize { size });
    }
    Ok(())
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
fn check_wiring(base: usize) -> Result<(), TrapError> {
    let targets = vector::SlotTargets {
        sync: __trap_sync_entry as usize,
        irq: __trap_irq_entry as usize,
        park: __vector_park as usize,
    };
    // SAFETY: every slot lies inside the linked table, which is readable text.
    let read_word = |at: usize| unsafe { core::ptr::read_volatile(at as *const u32) };
    vector::check_slots(base, read_word, &targets)
        .map_err(|(offset, target)| TrapError::SlotMiswired { offset, target })
}

/// The host stand-in table holds no code.
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
fn check_wiring(_base: usize) -> Result<(), TrapError> {
    Ok(())
}

/// Points VBAR_EL1 at the vector table and confirms the write took effect.
pub fn install() -> Result<usize, TrapError> {
    let base = vector_base();
    validate(base, vector_end())?;
    check_wiring(base)?;
    aarch64::write_vbar(base);
    let read = aarch64::read_vbar();
    if read != base {
        return Err(TrapError::VectorRejected { wrote: base, read });
    }
    Ok(base)
}

pub fn record(frame: &TrapFrame) {
    if let Some(mut last) = LAST_TRAP.try_lock() {
        *last = Some(*frame);
    }
}

pub fn last_trap() -> Option<TrapFrame> {
    LAST_TRAP.try_lock().and_then(|last| *last)
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    let class = ExceptionClass::from_esr(frame.esr);
    writeln!(f, " elr=0x{:016x} spsr=0x{:08x}", frame.elr, frame.spsr)?;
    writeln!(f, " esr=0x{:08x} ({})", frame.esr, class.name())?;
    writeln!(f, " far=0x{:016x} sp=0x{:016x}", frame.far, frame.sp)?;
    writeln!(f, " x0..x7 = {:016x?}", &frame.x[0..8])
}

/// Prints the diagnosis through the lock-free writer and parks the core.
pub fn fatal(frame: &TrapFrame, reason: FatalReason) -> ! {
    record(frame);
    let mut u = crate::uart::raw_writer();
    let class = ExceptionClass::from_esr(frame.esr);
    let _ = write!(
        u,
        "FATAL: {} class={} elr=0x{:x} far=0x{:x} esr=0x{:x}\n",
        reason,
        class.name(),
        frame.elr,
        frame.far,
        frame.esr
    );
    let _ = fmt_trap(frame, &mut u);
    aarch64::halt()
}

fn handle_page_fault(frame: &TrapFrame, addr: usize) {
    if let Some(context) = crate::sched::guard_hit(addr) {
        fatal(frame, FatalReason::StackOverflow { addr, context });
    }
    match mm::resolve_fault(addr) {
        Ok(outcome) => {
            #[cfg(feature = "trace_faults")]
            match outcome {
                FaultOutcome::Mapped { page, frame: pa } => {
                    crate::log_debug!(target: "trap", "fault {:#x} -> page {:#x} frame {:#x}", addr, page, pa)
                }
                FaultOutcome::AlreadyMapped { page } => {
                    crate::log_debug!(target: "trap", "fault {:#x} on mapped page {:#x}", addr, page)
                }
            }
            #[cfg(not(feature = "trace_faults"))]
            let _: FaultOutcome = outcome;
        }
        Err(FaultError::Repeated { page }) => fatal(frame, FatalReason::FaultLoop { page }),
        Err(err) => fatal(frame, FatalReason::Unresolved(err)),
    }
}

#[no_mangle]
extern "C" fn __trap_sync(frame: &mut TrapFrame) {
    match classify(frame) {
        TrapAction::Syscall => crate::syscall::handle_trap(frame),
        TrapAction::PageFault { addr } => handle_page_fault(frame, addr),
        TrapAction::Fatal(reason) => fatal(frame, reason),
    }
}

#[no_mangle]
extern "C" fn __trap_irq(frame: &mut TrapFrame, iar: u32) {
    crate::irq::dispatch(iar, frame);
}

#[no_mangle]
extern "C" fn __trap_nested() -> ! {
    let mut u = crate::uart::raw_writer();
    let _ = write!(u, "FATAL: {}\n", FatalReason::NestedFault);
    aarch64::halt()
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::string::String;

    use super::*;

    fn frame_with(esr: u64, far: u64) -> TrapFrame {
        TrapFrame { esr, far, ..TrapFrame::default() }
    }

    #[test]
    fn svc_is_a_syscall() {
        assert_eq!(classify(&frame_with(0x15 << 26, 0)), TrapAction::Syscall);
    }

    #[test]
    fn translation_faults_are_paged() {
        for level in 0..4u64 {
            let esr = (0x25 << 26) | 0b0001_00 | level;
            assert_eq!(
                classify(&frame_with(esr, 0x4800_0123)),
                TrapAction::PageFault { addr: 0x4800_0123 }
            );
        }
        let ifetch = (0x21 << 26) | 0b0001_11;
        assert_eq!(classify(&frame_with(ifetch, 0x4900_0000)), TrapAction::PageFault { addr: 0x4900_0000 });
    }

    #[test]
    fn permission_and_access_faults_are_fatal() {
        let perm = (0x25 << 26) | 0b0011_11;
        assert_eq!(
            classify(&frame_with(perm, 0x4008_0000)),
            TrapAction::Fatal(FatalReason::NotTranslation { addr: 0x4008_0000, status: 0b0011_11 })
        );
        let access = (0x24 << 26) | 0b0010_01;
        assert!(matches!(classify(&frame_with(access, 0)), TrapAction::Fatal(_)));
        let fnv = (0x25 << 26) | ISS_FNV | 0b0001_00;
        assert_eq!(classify(&frame_with(fnv, 0)), TrapAction::Fatal(FatalReason::FarInvalid));
    }

    #[test]
    fn unknown_and_other_classes_are_fatal() {
        assert_eq!(classify(&frame_with(0, 0)), TrapAction::Fatal(FatalReason::UnknownInstruction));
        assert_eq!(
            classify(&frame_with(0x3c << 26, 0)),
            TrapAction::Fatal(FatalReason::UnhandledClass(0x3c))
        );
    }

    #[test]
    fn install_writes_and_verifies_vbar() {
        let base = install().expect("install");
        assert_eq!(base % vector::VECTOR_ALIGN, 0);
        assert_eq!(aarch64::read_vbar(), base);
    }

    #[test]
    fn validate_rejects_bad_tables() {
        assert_eq!(validate(0x800, 0x1000), Ok(()));
        assert_eq!(validate(0x880, 0x1080), Err(TrapError::Misaligned { base: 0x880 }));
        assert_eq!(validate(0x800, 0x900), Err(TrapError::BadSize { size: 0x100 }));
    }

    #[test]
    fn record_and_query_last_trap() {
        let mut frame = TrapFrame::default();
        frame.elr = 0x1000;
        record(&frame);
        let recorded = last_trap().expect("trap stored");
        assert_eq!(recorded.elr, 0x1000);
    }

    #[test]
    fn fmt_includes_registers() {
        let frame = frame_with(0x96 << 24, 0x3000);
        let mut out = String::new();
        fmt_trap(&frame, &mut out).unwrap();
        assert!(out.contains("elr"));
        assert!(out.contains("data-abort"));
        assert!(out.contains("x0..x7"));
    }
}
