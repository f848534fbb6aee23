// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Linux/AArch64 process ABI surface emulated by the tether kernel
//! OWNERS: @kernel-team
//! PUBLIC API: nr::*, errno::*, MmapFlags, futex::*, auxv::*, clock::*, Timespec, encode_result()
//! DEPENDS_ON: bitflags
//! INVARIANTS: Numbers match the generic (asm-generic/unistd.h) table used by arm64;
//!             errors travel as small negative integers in x0

use bitflags::bitflags;

/// Syscall numbers from the arm64 generic table.
pub mod nr {
    /// `openat(dirfd, path, flags, mode)`
    pub const OPENAT: usize = 56;
    /// `close(fd)`
    pub const CLOSE: usize = 57;
    /// `read(fd, buf, len)`
    pub const READ: usize = 63;
    /// `write(fd, buf, len)`
    pub const WRITE: usize = 64;
    /// `exit(status)`
    pub const EXIT: usize = 93;
    /// `exit_group(status)`
    pub const EXIT_GROUP: usize = 94;
    /// `futex(uaddr, op, val, timeout, uaddr2, val3)`
    pub const FUTEX: usize = 98;
    /// `nanosleep(req, rem)`
    pub const NANOSLEEP: usize = 101;
    /// `clock_gettime(clock, ts)`
    pub const CLOCK_GETTIME: usize = 113;
    /// `sched_getaffinity(pid, len, mask)`
    pub const SCHED_GETAFFINITY: usize = 123;
    /// `sched_yield()`
    pub const SCHED_YIELD: usize = 124;
    /// `kill(pid, sig)`
    pub const KILL: usize = 129;
    /// `tkill(tid, sig)`
    pub const TKILL: usize = 130;
    /// `tgkill(tgid, tid, sig)`
    pub const TGKILL: usize = 131;
    /// `sigaltstack(ss, old)`
    pub const SIGALTSTACK: usize = 132;
    /// `rt_sigaction(sig, act, old, size)`
    pub const RT_SIGACTION: usize = 134;
    /// `rt_sigprocmask(how, set, old, size)`
    pub const RT_SIGPROCMASK: usize = 135;
    /// `getpid()`
    pub const GETPID: usize = 172;
    /// `gettid()`
    pub const GETTID: usize = 178;
    /// `munmap(addr, len)`
    pub const MUNMAP: usize = 215;
    /// `clone(flags, stack, ptid, tls, ctid)`
    pub const CLONE: usize = 220;
    /// `mmap(addr, len, prot, flags, fd, off)`
    pub const MMAP: usize = 222;
    /// `mprotect(addr, len, prot)`
    pub const MPROTECT: usize = 226;
    /// `madvise(addr, len, advice)`
    pub const MADVISE: usize = 233;
    /// `prlimit64(pid, resource, new, old)`
    pub const PRLIMIT64: usize = 261;
    /// `getrandom(buf, len, flags)`
    pub const GETRANDOM: usize = 278;
}

/// Error numbers returned (negated) in x0.
pub mod errno {
    /// No such file or directory.
    pub const ENOENT: i32 = 2;
    /// Bad file descriptor.
    pub const EBADF: i32 = 9;
    /// Resource temporarily unavailable.
    pub const EAGAIN: i32 = 11;
    /// Out of memory.
    pub const ENOMEM: i32 = 12;
    /// Bad address.
    pub const EFAULT: i32 = 14;
    /// Invalid argument.
    pub const EINVAL: i32 = 22;
    /// Too many open files in the system.
    pub const ENFILE: i32 = 23;
    /// Function not implemented.
    pub const ENOSYS: i32 = 38;
}

/// Encodes a syscall outcome into the register value returned in x0.
pub const fn encode_result(result: Result<usize, i32>) -> usize {
    match result {
        Ok(value) => value,
        Err(code) => (-(code as isize)) as usize,
    }
}

/// Decodes an x0 value back into a result; values in `-4095..0` are errors.
pub const fn decode_result(raw: usize) -> Result<usize, i32> {
    let signed = raw as isize;
    if signed < 0 && signed >= -4095 {
        Err((-signed) as i32)
    } else {
        Ok(raw)
    }
}

bitflags! {
    /// `mmap` flag bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MmapFlags: usize {
        /// Shared mapping.
        const SHARED = 0x01;
        /// Private mapping.
        const PRIVATE = 0x02;
        /// Place the mapping exactly at `addr`.
        const FIXED = 0x10;
        /// Mapping not backed by a file.
        const ANONYMOUS = 0x20;
        /// Do not reserve swap space.
        const NORESERVE = 0x4000;
    }
}

/// `futex` operation codes.
pub mod futex {
    /// Sleep while `*uaddr == val`.
    pub const WAIT: usize = 0;
    /// Wake up to `val` sleepers.
    pub const WAKE: usize = 1;
    /// Process-private variant flag.
    pub const PRIVATE_FLAG: usize = 128;
    /// Realtime clock flag, ignored.
    pub const CLOCK_REALTIME_FLAG: usize = 256;
    /// `WAIT | PRIVATE_FLAG`
    pub const WAIT_PRIVATE: usize = WAIT | PRIVATE_FLAG;
    /// `WAKE | PRIVATE_FLAG`
    pub const WAKE_PRIVATE: usize = WAKE | PRIVATE_FLAG;

    /// Strips modifier flags, leaving the base command.
    pub const fn command(op: usize) -> usize {
        op & !(PRIVATE_FLAG | CLOCK_REALTIME_FLAG)
    }
}

/// Auxiliary vector keys placed on the initial process stack.
pub mod auxv {
    /// Terminates the vector.
    pub const AT_NULL: u64 = 0;
    /// Address of the program headers.
    pub const AT_PHDR: u64 = 3;
    /// Size of one program header.
    pub const AT_PHENT: u64 = 4;
    /// Number of program headers.
    pub const AT_PHNUM: u64 = 5;
    /// System page size.
    pub const AT_PAGESZ: u64 = 6;
    /// Program entry point.
    pub const AT_ENTRY: u64 = 9;
    /// CPU capability bits.
    pub const AT_HWCAP: u64 = 16;
    /// Clock ticks per second.
    pub const AT_CLKTCK: u64 = 17;
    /// Address of 16 random bytes.
    pub const AT_RANDOM: u64 = 25;
    /// Address of the executable's path string.
    pub const AT_EXECFN: u64 = 31;
}

/// Clock identifiers accepted by `clock_gettime`.
pub mod clock {
    /// Wall clock.
    pub const REALTIME: usize = 0;
    /// Monotonic clock.
    pub const MONOTONIC: usize = 1;
    /// Per-process CPU time.
    pub const PROCESS_CPUTIME_ID: usize = 2;
    /// Per-thread CPU time.
    pub const THREAD_CPUTIME_ID: usize = 3;
    /// Monotonic, not NTP adjusted.
    pub const MONOTONIC_RAW: usize = 4;
    /// Coarse wall clock.
    pub const REALTIME_COARSE: usize = 5;
    /// Coarse monotonic clock.
    pub const MONOTONIC_COARSE: usize = 6;
    /// Monotonic including suspend.
    pub const BOOTTIME: usize = 7;
}

/// `struct timespec` as laid out on arm64.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timespec {
    /// Whole seconds.
    pub tv_sec: i64,
    /// Nanoseconds, always below one second.
    pub tv_nsec: i64,
}

/// Nanoseconds per second.
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

impl Timespec {
    /// Converts a counter reading into seconds and nanoseconds using integer arithmetic only.
    ///
    /// `freq` of zero yields the zero timespec.
    pub const fn from_ticks(ticks: u64, freq: u64) -> Self {
        if freq == 0 {
            return Self { tv_sec: 0, tv_nsec: 0 };
        }
        let secs = ticks / freq;
        let rem = ticks % freq;
        // rem < freq, so rem * 1e9 stays below 2^64 for any freq under ~18 GHz.
        let nanos = rem * NSEC_PER_SEC / freq;
        Self { tv_sec: secs as i64, tv_nsec: nanos as i64 }
    }

    /// Total nanoseconds represented by this value.
    pub const fn as_nanos(&self) -> u64 {
        self.tv_sec as u64 * NSEC_PER_SEC + self.tv_nsec as u64
    }
}

/// `struct rlimit` as read and written by `prlimit64`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rlimit {
    /// Soft limit.
    pub cur: u64,
    /// Hard limit.
    pub max: u64,
}

/// Value reported for limits that are not enforced.
pub const RLIM_INFINITY: u64 = u64::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_results_use_twos_complement() {
        assert_eq!(encode_result(Err(errno::ENOSYS)), usize::MAX - 37);
        assert_eq!(decode_result(encode_result(Err(errno::EAGAIN))), Err(errno::EAGAIN));
        assert_eq!(decode_result(0x4800_0000), Ok(0x4800_0000));
    }

    #[test]
    fn futex_command_ignores_modifiers() {
        assert_eq!(futex::command(futex::WAIT_PRIVATE), futex::WAIT);
        assert_eq!(futex::command(futex::WAKE_PRIVATE | futex::CLOCK_REALTIME_FLAG), futex::WAKE);
    }
}
