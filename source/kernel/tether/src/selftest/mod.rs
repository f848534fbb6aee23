// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot self-tests run on the real machine before the runtime is entered.
//!
//! Each test prints `SELFTEST: <name> ok`; a failure prints `SELFTEST: fail: ..`
//! and panics.

pub mod assert;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tether_abi::{decode_result, errno, nr, MmapFlags, Timespec};

use crate::mm::{self, PAGE_SIZE};
use crate::{preempt, sched, st_assert, st_expect_eq, uart};

const COUNT_ROUNDS: usize = 4_000_000;

static WORKER_RESULT: AtomicU64 = AtomicU64::new(0);
static WORKER_DONE: AtomicBool = AtomicBool::new(false);

/// Entry point invoked by boot once interrupts are live.
pub fn run() {
    uart::write_line("SELFTEST: begin");
    vectors();
    uart::write_line("SELFTEST: vectors ok");
    fault_retry();
    uart::write_line("SELFTEST: fault_retry ok");
    syscall_scenarios();
    uart::write_line("SELFTEST: syscalls ok");
    preempt_counting();
    uart::write_line("SELFTEST: preempt_counting ok");
    uart::write_line("SELFTEST: end");
}

fn vectors() {
    st_expect_eq!(crate::arch::aarch64::read_vbar(), crate::trap::vector_base());
    st_expect_eq!(crate::trap::vector_base() % crate::trap::vector::VECTOR_ALIGN, 0);
    // The root context takes its traps on the fixed exception stack.
    let exception = &mm::layout::EXCEPTION_STACK;
    st_expect_eq!(crate::trap::trap_stack(), (exception.base, exception.end()));
}

/// First touch of a hint-less page maps it; later touches allocate nothing.
fn fault_retry() {
    let page = match mm::with_bump(|bump| bump.alloc(PAGE_SIZE)) {
        Ok(page) => page,
        Err(err) => assert::report_failure_fmt(format_args!("bump: {}", err)),
    };
    let resolved = || mm::with_kernel_space(|space| space.resolved_faults()).unwrap_or(0);
    let before = resolved();
    let word = page as *mut u64;
    // SAFETY: `page` was just reserved from the demand window; the first access faults it in.
    unsafe {
        core::ptr::write_volatile(word, 0x7465_7468_6572);
        st_expect_eq!(core::ptr::read_volatile(word), 0x7465_7468_6572);
        core::ptr::write_volatile(word.add(1), 1);
    }
    st_expect_eq!(resolved() - before, 1);
}

fn syscall_scenarios() {
    let hint = 0x40_0000_0000;
    let flags = (MmapFlags::PRIVATE | MmapFlags::ANONYMOUS).bits();
    st_expect_eq!(decode_result(syscall(nr::MMAP, [hint, 0x10_0000, 3, flags, usize::MAX, 0])), Ok(hint));

    let first = decode_result(syscall(nr::MMAP, [0, PAGE_SIZE, 3, flags, usize::MAX, 0]));
    let second = decode_result(syscall(nr::MMAP, [0, PAGE_SIZE, 3, flags, usize::MAX, 0]));
    st_assert!(matches!((first, second), (Ok(a), Ok(b)) if b == a + PAGE_SIZE), "bump maps adjacent");

    let mut a = [0u8; 16];
    let mut b = [0u8; 16];
    syscall(nr::GETRANDOM, [a.as_mut_ptr() as usize, a.len(), 0, 0, 0, 0]);
    syscall(nr::GETRANDOM, [b.as_mut_ptr() as usize, b.len(), 0, 0, 0, 0]);
    st_assert!(a != b, "getrandom repeated itself");

    st_expect_eq!(decode_result(syscall(999, [0; 6])), Err(errno::ENOSYS));

    let mut t0 = Timespec::default();
    let mut t1 = Timespec::default();
    syscall(nr::CLOCK_GETTIME, [1, &mut t0 as *mut Timespec as usize, 0, 0, 0, 0]);
    syscall(nr::CLOCK_GETTIME, [1, &mut t1 as *mut Timespec as usize, 0, 0, 0, 0]);
    st_assert!(t1.as_nanos() >= t0.as_nanos(), "monotonic clock went backwards");
}

/// Integer and FP work whose result depends on every intermediate register value.
#[inline(never)]
fn count(rounds: usize) -> u64 {
    let mut acc = 0u64;
    let mut f = 0.0f64;
    for i in 0..rounds as u64 {
        acc = acc.wrapping_mul(31).wrapping_add(i ^ (acc >> 7));
        f += (i & 0xff) as f64 * 0.5;
        core::hint::black_box(&acc);
    }
    acc ^ f.to_bits()
}

extern "C" fn counting_worker(rounds: usize) {
    WORKER_RESULT.store(count(rounds), Ordering::Release);
    WORKER_DONE.store(true, Ordering::Release);
}

/// The same loop computed undisturbed, under preemption, and on a second context agrees.
fn preempt_counting() {
    let reference = {
        let _quiet = preempt::disable();
        count(COUNT_ROUNDS)
    };
    let injected_before = preempt::injections();
    if let Err(err) = sched::spawn("selftest-count", counting_worker, COUNT_ROUNDS, 0) {
        assert::report_failure_fmt(format_args!("spawn: {}", err));
    }
    let interleaved = count(COUNT_ROUNDS);
    while !WORKER_DONE.load(Ordering::Acquire) {
        sched::yield_now();
    }
    st_expect_eq!(interleaved, reference);
    st_expect_eq!(WORKER_RESULT.load(Ordering::Acquire), reference);
    crate::log_info!(
        target: "selftest",
        "preemptions during count: {}",
        preempt::injections() - injected_before
    );
}

/// Issues a syscall through the same path the runtime uses.
fn syscall(number: usize, args: [usize; 6]) -> usize {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        let ret: usize;
        // SAFETY: `svc #0` enters the syscall vector, which preserves every register but x0.
        unsafe {
            core::arch::asm!(
                "svc #0",
                inlateout("x0") args[0] => ret,
                in("x1") args[1],
                in("x2") args[2],
                in("x3") args[3],
                in("x4") args[4],
                in("x5") args[5],
                in("x8") number,
                options(nostack),
            );
        }
        ret
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        let mut frame = crate::trap::TrapFrame::default();
        frame.x[..6].copy_from_slice(&args.map(|a| a as u64));
        frame.x[8] = number as u64;
        crate::syscall::handle_trap(&mut frame);
        frame.x[0] as usize
    }
}
