// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: table(), Context, PostAction
//! DEPENDS_ON: mm::BumpAllocator, sched::Scheduler, syscall::{futex, entropy}, uart, hal::Timer
//! INVARIANTS: Decode→Check→Execute; handlers never switch contexts themselves, they
//!             request it through `Context::post`; hints are returned verbatim
//!
//! The runtime shares the kernel's single address space, so user pointers are
//! plain addresses. A buffer that lies in the demand window may fault while a
//! handler copies; the fault path resolves it because handlers never hold the
//! address-space lock.

use core::mem::{align_of, size_of};

use tether_abi::{clock, futex, nr, MmapFlags, Rlimit, Timespec, NSEC_PER_SEC, RLIM_INFINITY};

use super::{Args, Error, SysResult, SyscallTable};
use crate::hal::Timer;
use crate::mm::BumpAllocator;
use crate::sched::Scheduler;
use crate::syscall::{Entropy, FutexQueue};

/// Address returned for zero-length anonymous maps without a hint.
pub const EMPTY_MAPPING: usize = 0x1000;
/// Affinity mask reported by `sched_getaffinity`: core 0 only.
pub const AFFINITY_MASK: u64 = 0x1;
/// Process id reported by `getpid`.
pub const PID: usize = 1;
/// Descriptor handed out for the random device.
pub const RANDOM_FD: usize = 3;
/// The one path `openat` resolves.
const RANDOM_DEVICE: &[u8] = b"/dev/random";
/// Longest path `openat` will scan for its terminator.
const PATH_MAX: usize = 256;

const STACK_T_SIZE: usize = 24;
const SIGACTION_SIZE: usize = 32;
/// Largest signal set `rt_sigprocmask` will clear.
const MAX_SIGSET_SIZE: usize = 128;

/// What the trap path does once every lock is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostAction {
    Resume,
    /// Give up the core; the current context may have been blocked or killed.
    Yield,
    /// Stop the machine with the given exit status.
    Halt(i32),
}

/// Everything a handler may touch, borrowed for one syscall.
pub struct Context<'a> {
    pub bump: &'a mut BumpAllocator,
    /// `None` until the scheduler root exists.
    pub scheduler: Option<&'a mut Scheduler>,
    pub futex: &'a mut FutexQueue,
    pub entropy: &'a mut Entropy,
    pub timer: &'a dyn Timer,
    pub post: PostAction,
}

impl<'a> Context<'a> {
    pub fn new(
        bump: &'a mut BumpAllocator,
        scheduler: Option<&'a mut Scheduler>,
        futex: &'a mut FutexQueue,
        entropy: &'a mut Entropy,
        timer: &'a dyn Timer,
    ) -> Self {
        Self { bump, scheduler, futex, entropy, timer, post: PostAction::Resume }
    }

    fn current(&self) -> usize {
        self.scheduler.as_ref().map_or(crate::sched::ROOT_CONTEXT, |s| s.current())
    }
}

/// Builds the dispatch table.
pub const fn table() -> SyscallTable {
    SyscallTable::new()
        .with(nr::OPENAT, sys_openat)
        .with(nr::CLOSE, sys_close)
        .with(nr::READ, sys_read)
        .with(nr::WRITE, sys_write)
        .with(nr::EXIT, sys_exit)
        .with(nr::EXIT_GROUP, sys_exit_group)
        .with(nr::FUTEX, sys_futex)
        .with(nr::NANOSLEEP, sys_nanosleep)
        .with(nr::CLOCK_GETTIME, sys_clock_gettime)
        .with(nr::SCHED_GETAFFINITY, sys_sched_getaffinity)
        .with(nr::SCHED_YIELD, sys_sched_yield)
        .with(nr::KILL, sys_accept)
        .with(nr::TKILL, sys_accept)
        .with(nr::TGKILL, sys_accept)
        .with(nr::SIGALTSTACK, sys_sigaltstack)
        .with(nr::RT_SIGACTION, sys_rt_sigaction)
        .with(nr::RT_SIGPROCMASK, sys_rt_sigprocmask)
        .with(nr::GETPID, sys_getpid)
        .with(nr::GETTID, sys_gettid)
        .with(nr::MUNMAP, sys_accept)
        .with(nr::CLONE, sys_clone)
        .with(nr::MMAP, sys_mmap)
        .with(nr::MPROTECT, sys_accept)
        .with(nr::MADVISE, sys_accept)
        .with(nr::PRLIMIT64, sys_prlimit64)
        .with(nr::GETRANDOM, sys_getrandom)
}

// User memory access

fn user_bytes<'u>(addr: usize, len: usize) -> SysResult<&'u [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if addr == 0 || addr.checked_add(len).is_none() {
        return Err(Error::BadAddress(addr));
    }
    // SAFETY: one address space; the range is non-null and does not wrap. Unmapped
    // demand pages are populated by the fault path on first touch.
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

fn user_bytes_mut<'u>(addr: usize, len: usize) -> SysResult<&'u mut [u8]> {
    if len == 0 {
        return Ok(&mut []);
    }
    if addr == 0 || addr.checked_add(len).is_none() {
        return Err(Error::BadAddress(addr));
    }
    // SAFETY: as for `user_bytes`; the caller handed us exclusive use of the buffer.
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

/// Borrows a NUL-terminated path, without the terminator.
fn user_path<'u>(addr: usize) -> SysResult<&'u [u8]> {
    if addr == 0 {
        return Err(Error::BadAddress(addr));
    }
    let mut len = 0;
    // SAFETY: non-null; bytes are read one at a time up to the first NUL or PATH_MAX,
    // and demand pages behind them fault in as for `user_bytes`.
    while len < PATH_MAX && unsafe { core::ptr::read_volatile((addr + len) as *const u8) } != 0 {
        len += 1;
    }
    if len == PATH_MAX {
        return Err(Error::InvalidArgument);
    }
    user_bytes(addr, len)
}

fn write_user<T: Copy>(addr: usize, value: T) -> SysResult<()> {
    if addr == 0 || addr % align_of::<T>() != 0 {
        return Err(Error::BadAddress(addr));
    }
    // SAFETY: non-null and aligned for `T`; see `user_bytes`.
    unsafe { core::ptr::write_volatile(addr as *mut T, value) };
    Ok(())
}

/// Zero-fills an optional out-pointer; null means the caller does not want the old value.
fn clear_optional(addr: usize, len: usize) -> SysResult<()> {
    if addr != 0 {
        user_bytes_mut(addr, len)?.fill(0);
    }
    Ok(())
}

// Typed decoders

#[derive(Copy, Clone)]
struct MmapArgsTyped {
    addr: usize,
    len: usize,
    flags: MmapFlags,
}

impl MmapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { addr: args.get(0), len: args.get(1), flags: MmapFlags::from_bits_retain(args.get(3)) }
    }

    /// Placement requested by the caller, if any.
    #[inline]
    fn hint(&self) -> Option<usize> {
        (self.flags.contains(MmapFlags::FIXED) || self.addr != 0).then_some(self.addr)
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum FutexOp {
    Wait,
    Wake,
}

#[derive(Copy, Clone)]
struct FutexArgsTyped {
    uaddr: usize,
    op: FutexOp,
    val: usize,
}

impl FutexArgsTyped {
    #[inline]
    fn decode(args: &Args) -> SysResult<Self> {
        let op = match futex::command(args.get(1)) {
            futex::WAIT => FutexOp::Wait,
            futex::WAKE => FutexOp::Wake,
            _ => return Err(Error::InvalidArgument),
        };
        Ok(Self { uaddr: args.get(0), op, val: args.get(2) })
    }

    #[inline]
    fn check(&self) -> SysResult<()> {
        if self.uaddr == 0 {
            return Err(Error::BadAddress(0));
        }
        if self.uaddr % align_of::<u32>() != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct IoArgsTyped {
    fd: usize,
    buf: usize,
    len: usize,
}

impl IoArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { fd: args.get(0), buf: args.get(1), len: args.get(2) }
    }
}

// Handlers

fn sys_mmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = MmapArgsTyped::decode(args);
    if let Some(hint) = typed.hint() {
        return Ok(hint);
    }
    if typed.len == 0 {
        return Ok(EMPTY_MAPPING);
    }
    Ok(ctx.bump.alloc(typed.len)?)
}

/// Accepted and ignored: munmap, mprotect, madvise and signal delivery.
fn sys_accept(_ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(0)
}

fn sys_futex(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = FutexArgsTyped::decode(args)?;
    typed.check()?;
    match typed.op {
        FutexOp::Wait => {
            // SAFETY: checked non-null and 4-byte aligned.
            let observed = unsafe { core::ptr::read_volatile(typed.uaddr as *const u32) };
            if observed != typed.val as u32 {
                return Err(Error::TryAgain);
            }
            let Some(sched) = ctx.scheduler.as_deref_mut() else {
                return Ok(0);
            };
            // Parking the only runnable context would stop the machine; report a spurious wakeup.
            if !sched.has_runnable() {
                return Ok(0);
            }
            if ctx.futex.park(typed.uaddr, sched.current()).is_err() {
                return Ok(0);
            }
            sched.block_current();
            ctx.post = PostAction::Yield;
            Ok(0)
        }
        FutexOp::Wake => {
            let Some(sched) = ctx.scheduler.as_deref_mut() else {
                return Ok(0);
            };
            let woken = ctx.futex.wake(typed.uaddr, typed.val, |id| {
                sched.wake(id);
            });
            Ok(woken)
        }
    }
}

fn sys_getrandom(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let out = user_bytes_mut(args.get(0), args.get(1))?;
    let marker = 0u8;
    let stack_hint = core::ptr::addr_of!(marker) as usize;
    Ok(ctx.entropy.fill(out, crate::arch::aarch64::counter(), stack_hint))
}

fn sys_clock_gettime(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let id = args.get(0);
    if id > clock::BOOTTIME {
        return Err(Error::InvalidArgument);
    }
    // Every clock reads the same counter; there is no wall-clock source.
    let now = Timespec::from_ticks(ctx.timer.now(), NSEC_PER_SEC);
    write_user(args.get(1), now)?;
    Ok(0)
}

fn sys_clone(_ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Err(Error::TryAgain)
}

fn sys_write(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = IoArgsTyped::decode(args);
    match typed.fd {
        1 | 2 => {
            let bytes = user_bytes(typed.buf, typed.len)?;
            crate::uart::write_console(bytes);
            Ok(bytes.len())
        }
        fd => Err(Error::BadDescriptor(fd)),
    }
}

fn sys_read(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = IoArgsTyped::decode(args);
    match typed.fd {
        0 => Ok(crate::uart::read_input(user_bytes_mut(typed.buf, typed.len)?)),
        RANDOM_FD if ctx.entropy.device_open() => {
            if typed.buf == 0 {
                return Err(Error::BadAddress(0));
            }
            let out = user_bytes_mut(typed.buf, typed.len.min(u32::MAX as usize))?;
            let marker = 0u8;
            let stack_hint = core::ptr::addr_of!(marker) as usize;
            Ok(ctx.entropy.fill(out, crate::arch::aarch64::counter(), stack_hint))
        }
        fd => Err(Error::BadDescriptor(fd)),
    }
}

fn sys_openat(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let path = user_path(args.get(1))?;
    if path != RANDOM_DEVICE {
        crate::log_debug!(target: "syscall", "openat: no entry for {:?}", core::str::from_utf8(path));
        return Err(Error::NoEntry);
    }
    if !ctx.entropy.open_device() {
        return Err(Error::TableFull);
    }
    Ok(RANDOM_FD)
}

fn sys_close(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    if args.get(0) == RANDOM_FD {
        ctx.entropy.close_device();
    }
    Ok(0)
}

fn sys_exit(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let status = args.get(0) as i32;
    let current = ctx.current();
    crate::log_info!(target: "syscall", "context {} exited status={}", current, status);
    ctx.post = match ctx.scheduler.as_deref_mut() {
        Some(sched) => {
            sched.exit_current();
            if sched.has_runnable() {
                PostAction::Yield
            } else {
                PostAction::Halt(status)
            }
        }
        None => PostAction::Halt(status),
    };
    Ok(0)
}

fn sys_exit_group(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ctx.post = PostAction::Halt(args.get(0) as i32);
    Ok(0)
}

fn sys_nanosleep(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ctx.post = PostAction::Yield;
    Ok(0)
}

fn sys_sched_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ctx.post = PostAction::Yield;
    Ok(0)
}

fn sys_sched_getaffinity(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    if args.get(1) < size_of::<u64>() {
        return Err(Error::InvalidArgument);
    }
    write_user(args.get(2), AFFINITY_MASK)?;
    Ok(size_of::<u64>())
}

fn sys_sigaltstack(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    clear_optional(args.get(1), STACK_T_SIZE)?;
    Ok(0)
}

fn sys_rt_sigaction(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    clear_optional(args.get(2), SIGACTION_SIZE)?;
    Ok(0)
}

fn sys_rt_sigprocmask(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    clear_optional(args.get(2), args.get(3).min(MAX_SIGSET_SIZE))?;
    Ok(0)
}

fn sys_getpid(_ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(PID)
}

fn sys_gettid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.current() + 1)
}

fn sys_prlimit64(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let old = args.get(3);
    if old != 0 {
        write_user(old, Rlimit { cur: RLIM_INFINITY, max: RLIM_INFINITY })?;
    }
    Ok(0)
}
