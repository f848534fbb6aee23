// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! PL011 console used for kernel logs, the `write`/`read` syscalls and fatal diagnostics.
//!
//! Host builds route transmitted bytes into an in-memory sink so tests can
//! assert on diagnostics without touching MMIO.

use core::fmt::{self, Write};
use spin::Mutex;

use crate::mm::layout;

const UART_DR: usize = 0x00;
const UART_FR: usize = 0x18;
const UART_IMSC: usize = 0x38;
const UART_ICR: usize = 0x44;
const FR_RXFE: u32 = 1 << 4;
const FR_TXFF: u32 = 1 << 5;
const INT_RX: u32 = 1 << 4;
const INT_RT: u32 = 1 << 6;

const RX_CAPACITY: usize = 256;

/// Global UART writer used for kernel logs.
static UART0: Mutex<KernelUart> = Mutex::new(KernelUart::new(layout::UART.base));

/// Bytes received on the console line, drained by `read(0, ..)`.
static RX_RING: Mutex<RxRing> = Mutex::new(RxRing::new());

/// UART implementation capable of formatted writes.
#[derive(Clone, Copy)]
pub struct KernelUart {
    base: usize,
}

impl KernelUart {
    /// Creates a UART abstraction rooted at `base`.
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Returns a guard for the console singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        UART0.lock()
    }

    /// Returns the guard if nobody else currently holds the console.
    pub fn try_lock() -> Option<spin::MutexGuard<'static, KernelUart>> {
        UART0.try_lock()
    }

    /// Transmits raw bytes without newline translation.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            put_byte(self.base, byte);
        }
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                put_byte(self.base, b'\r');
            }
            put_byte(self.base, byte);
        }
        Ok(())
    }
}

/// Lock-free writer for trap and panic contexts where the mutex may already be held.
pub struct RawUart;

impl Write for RawUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                put_byte(layout::UART.base, b'\r');
            }
            put_byte(layout::UART.base, byte);
        }
        Ok(())
    }
}

pub fn raw_writer() -> RawUart {
    RawUart
}

/// Writes the provided string via the global UART.
pub fn write_str(message: &str) {
    let _guard = crate::preempt::disable();
    let mut uart = KernelUart::lock();
    let _ = uart.write_str(message);
}

/// Sends program output verbatim; used by `write(1|2, ..)`.
pub fn write_console(bytes: &[u8]) {
    let _guard = crate::preempt::disable();
    match KernelUart::try_lock() {
        Some(mut uart) => uart.write_bytes(bytes),
        None => bytes.iter().for_each(|&b| put_byte(layout::UART.base, b)),
    }
}

/// Writes a line terminated by `\n` to the UART.
pub fn write_line(message: &str) {
    write_str(message);
    write_str("\n");
}

/// Unmasks the receive and receive-timeout interrupts.
pub fn enable_rx_interrupt() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        let base = layout::UART.base;
        core::ptr::write_volatile((base + UART_ICR) as *mut u32, INT_RX | INT_RT);
        core::ptr::write_volatile((base + UART_IMSC) as *mut u32, INT_RX | INT_RT);
    }
}

/// Device-ready interrupt: moves every pending byte from the FIFO into the receive ring.
pub fn on_rx_ready() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        let base = layout::UART.base;
        let mut ring = RX_RING.lock();
        // SAFETY: the UART window is identity mapped as device memory at boot.
        unsafe {
            while core::ptr::read_volatile((base + UART_FR) as *const u32) & FR_RXFE == 0 {
                let byte = core::ptr::read_volatile((base + UART_DR) as *const u32) as u8;
                ring.push(byte);
            }
            core::ptr::write_volatile((base + UART_ICR) as *mut u32, INT_RX | INT_RT);
        }
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = (FR_RXFE, UART_FR, UART_ICR, UART_IMSC, INT_RX, INT_RT, &RX_RING);
}

/// Copies buffered input into `out`, returning the number of bytes written.
pub fn read_input(out: &mut [u8]) -> usize {
    let mut ring = RX_RING.lock();
    let mut n = 0;
    while n < out.len() {
        match ring.pop() {
            Some(byte) => {
                out[n] = byte;
                n += 1;
            }
            None => break,
        }
    }
    n
}

/// Feeds bytes into the receive ring as if they arrived on the wire.
#[cfg(test)]
pub fn inject_input(bytes: &[u8]) {
    let mut ring = RX_RING.lock();
    for &b in bytes {
        ring.push(b);
    }
}

struct RxRing {
    buf: [u8; RX_CAPACITY],
    head: usize,
    len: usize,
}

impl RxRing {
    const fn new() -> Self {
        Self { buf: [0; RX_CAPACITY], head: 0, len: 0 }
    }

    fn push(&mut self, byte: u8) {
        if self.len == RX_CAPACITY {
            // Drop the oldest byte.
            self.head = (self.head + 1) % RX_CAPACITY;
            self.len -= 1;
        }
        let tail = (self.head + self.len) % RX_CAPACITY;
        self.buf[tail] = byte;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % RX_CAPACITY;
        self.len -= 1;
        Some(byte)
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[inline]
fn put_byte(base: usize, byte: u8) {
    // SAFETY: `base` is the PL011 window from the memory map, mapped as device memory.
    unsafe {
        while core::ptr::read_volatile((base + UART_FR) as *const u32) & FR_TXFF != 0 {}
        core::ptr::write_volatile((base + UART_DR) as *mut u32, byte as u32);
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
#[inline]
fn put_byte(_base: usize, byte: u8) {
    let _ = (FR_TXFF, UART_DR);
    host_sink::push(byte);
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub mod host_sink {
    //! Capture buffer standing in for the console on host builds.

    use spin::Mutex;

    const CAPACITY: usize = 256 * 1024;

    static SINK: Mutex<([u8; CAPACITY], usize)> = Mutex::new(([0; CAPACITY], 0));

    pub(super) fn push(byte: u8) {
        let mut sink = SINK.lock();
        let (buf, len) = &mut *sink;
        if *len == CAPACITY {
            buf.copy_within(CAPACITY / 2.., 0);
            *len = CAPACITY / 2;
        }
        buf[*len] = byte;
        *len += 1;
    }

    /// Returns `true` when `needle` appears in the captured output.
    pub fn contains(needle: &str) -> bool {
        let sink = SINK.lock();
        let (buf, len) = &*sink;
        buf[..*len].windows(needle.len().max(1)).any(|w| w == needle.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_ring_preserves_order_and_drops_oldest() {
        let mut ring = RxRing::new();
        for b in 0..(RX_CAPACITY + 2) {
            ring.push(b as u8);
        }
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.len, RX_CAPACITY - 1);
    }

    #[test]
    fn writes_reach_host_sink() {
        write_line("uart-sink-check");
        assert!(host_sink::contains("uart-sink-check"));
    }
}
