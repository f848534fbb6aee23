// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Linux/AArch64 syscall emulation for the hosted runtime
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, TABLE, Args, Error, Handler, handle_trap(frame)
//! DEPENDS_ON: syscall::api (handlers), mm (bump cursor), sched (yield, futex parking), tether-abi
//! INVARIANTS: Number in x8, args in x0..x5, result in x0; errors leave as -errno;
//!             dispatch is a bounds-checked index; no lock is held across a yield
//!
//! Thread creation is refused and futex waits only park when another context can
//! run: both rest on there being one core. Revisit them together with the locking
//! here before running on more than one.

pub mod api;
pub mod entropy;
pub mod futex;

use core::fmt;

use spin::Mutex;
use tether_abi::{encode_result, errno};

use crate::hal::virt::VirtTimer;
use crate::mm::{self, BumpError};
use crate::trap::TrapFrame;

pub use api::{Context, PostAction};
pub use entropy::Entropy;
pub use futex::{FutexQueue, FUTEX_SLOTS};

/// Size of the dispatch window; covers every arm64 generic number in use.
pub const MAX_SYSCALL: usize = 512;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments taken from x0..x5.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Error returned by the dispatcher and handlers; converted to errno only on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Number has no entry in the dispatch table.
    NotImplemented(usize),
    /// Descriptor is not one of the console streams.
    BadDescriptor(usize),
    /// Path names nothing the kernel serves.
    NoEntry,
    /// The only instance of a device is already open.
    TableFull,
    /// Value changed under `futex` wait, or thread creation refused.
    TryAgain,
    /// Null or misaligned user pointer.
    BadAddress(usize),
    /// Unsupported operation code or argument.
    InvalidArgument,
    /// Bump region exhausted.
    OutOfMemory(BumpError),
}

impl Error {
    /// Linux error number for this failure.
    pub const fn errno(self) -> i32 {
        match self {
            Self::NotImplemented(_) => errno::ENOSYS,
            Self::BadDescriptor(_) => errno::EBADF,
            Self::NoEntry => errno::ENOENT,
            Self::TableFull => errno::ENFILE,
            Self::TryAgain => errno::EAGAIN,
            Self::BadAddress(_) => errno::EFAULT,
            Self::InvalidArgument => errno::EINVAL,
            Self::OutOfMemory(_) => errno::ENOMEM,
        }
    }
}

impl From<BumpError> for Error {
    fn from(value: BumpError) -> Self {
        Self::OutOfMemory(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotImplemented(nr) => write!(f, "unknown syscall nr={}", nr),
            Self::BadDescriptor(fd) => write!(f, "bad file descriptor {}", fd),
            Self::NoEntry => f.write_str("no such file"),
            Self::TableFull => f.write_str("descriptor already open"),
            Self::TryAgain => f.write_str("try again"),
            Self::BadAddress(addr) => write!(f, "bad user address 0x{:x}", addr),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::OutOfMemory(err) => write!(f, "{}", err),
        }
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number. Built once, in a `const` context.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Builder step; numbers outside the window are ignored.
    pub const fn with(mut self, number: usize, handler: Handler) -> Self {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
        self
    }

    pub fn is_registered(&self, number: usize) -> bool {
        matches!(self.handlers.get(number), Some(Some(_)))
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(&self, number: usize, ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::NotImplemented(number))
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The emulated syscall surface.
pub static TABLE: SyscallTable = api::table();

/// Per-boot state owned by the syscall layer.
struct SyscallState {
    futex: FutexQueue,
    entropy: Entropy,
}

static STATE: Mutex<SyscallState> =
    Mutex::new(SyscallState { futex: FutexQueue::new(), entropy: Entropy::new() });

/// Dispatches `number` and encodes the outcome for x0, logging unknown numbers.
pub fn execute(table: &SyscallTable, number: usize, ctx: &mut Context<'_>, args: &Args) -> usize {
    let result = table.dispatch(number, ctx, args);
    match result {
        Err(err @ Error::NotImplemented(_)) => crate::log_warn!(target: "syscall", "{}", err),
        #[cfg(feature = "debug_uart")]
        Err(err) => crate::log_debug!(target: "syscall", "nr={} -> {}", number, err),
        _ => {}
    }
    encode_result(result.map_err(Error::errno))
}

/// Synchronous-trap entry for `svc #0`.
///
/// Locks are taken in the order syscall state, bump cursor, scheduler and are
/// all released before any yield or halt.
pub fn handle_trap(frame: &mut TrapFrame) {
    let number = frame.syscall_number();
    let args = Args::new(frame.syscall_args());
    let timer = VirtTimer;
    let (ret, post) = {
        let mut state = STATE.lock();
        let state = &mut *state;
        mm::with_bump(|bump| {
            let mut sched = crate::sched::lock();
            let mut ctx = Context::new(
                bump,
                sched.as_mut(),
                &mut state.futex,
                &mut state.entropy,
                &timer,
            );
            let ret = execute(&TABLE, number, &mut ctx, &args);
            (ret, ctx.post)
        })
    };
    frame.set_return(ret);
    match post {
        PostAction::Resume => {}
        PostAction::Yield => crate::sched::yield_now(),
        PostAction::Halt(status) => {
            crate::log_info!(target: "syscall", "runtime exited status={}", status);
            crate::arch::aarch64::halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_abi::decode_result;

    fn ok_handler(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
        Ok(args.get(0) + 1)
    }

    const SMALL: SyscallTable = SyscallTable::new().with(7, ok_handler).with(MAX_SYSCALL, ok_handler);

    #[test]
    fn const_builder_registers_within_window() {
        assert!(SMALL.is_registered(7));
        assert!(!SMALL.is_registered(8));
        assert!(!SMALL.is_registered(MAX_SYSCALL));
    }

    #[test]
    fn unknown_number_is_enosys_and_logged() {
        let mut harness = api::tests::Harness::new();
        let mut ctx = harness.context();
        let raw = execute(&TABLE, 999, &mut ctx, &Args::default());
        assert_eq!(decode_result(raw), Err(errno::ENOSYS));
        assert!(crate::uart::host_sink::contains("unknown syscall nr=999"));
    }

    #[test]
    fn numbers_past_the_window_are_enosys() {
        let mut harness = api::tests::Harness::new();
        let mut ctx = harness.context();
        let raw = execute(&TABLE, usize::MAX, &mut ctx, &Args::default());
        assert_eq!(decode_result(raw), Err(errno::ENOSYS));
    }

    #[test]
    fn errors_map_to_linux_numbers() {
        assert_eq!(Error::OutOfMemory(BumpError::OutOfMemory).errno(), errno::ENOMEM);
        assert_eq!(Error::BadDescriptor(5).errno(), errno::EBADF);
        assert_eq!(Error::TryAgain.errno(), errno::EAGAIN);
        assert_eq!(Error::NoEntry.errno(), errno::ENOENT);
        assert_eq!(Error::TableFull.errno(), errno::ENFILE);
    }
}
