// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Assertions for boot self-tests. A failure prints a `SELFTEST: fail:` marker
//! without allocating, then panics so the panic handler dumps the last trap.

use core::fmt::{Arguments, Write};

#[cold]
pub fn report_failure(message: &str) -> ! {
    report_failure_fmt(format_args!("{}", message))
}

#[cold]
pub fn report_failure_fmt(args: Arguments<'_>) -> ! {
    let mut out = crate::uart::raw_writer();
    let _ = write!(out, "SELFTEST: fail: {}\n", args);
    panic!("selftest failed: {}", args);
}

/// Fails the boot unless `cond` holds.
#[macro_export]
macro_rules! st_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::selftest::assert::report_failure(concat!("assertion failed: ", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::selftest::assert::report_failure_fmt(format_args!($($arg)+));
        }
    };
}

/// Fails the boot unless both sides compare equal; prints both values.
#[macro_export]
macro_rules! st_expect_eq {
    ($left:expr, $right:expr $(,)?) => {
        match (&$left, &$right) {
            (l, r) if *l == *r => {}
            (l, r) => $crate::selftest::assert::report_failure_fmt(format_args!(
                "{} != {} ({:?} vs {:?})",
                stringify!($left),
                stringify!($right),
                l,
                r
            )),
        }
    };
}
