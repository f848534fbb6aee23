// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel panic handler emitting deterministic diagnostics over the UART
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: trap::last_trap(), uart::raw_writer()
//! INVARIANTS: No allocation; never takes the console lock; always halts

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use core::fmt::Write;

    crate::arch::aarch64::mask_irqs();
    let mut w = crate::uart::raw_writer();
    let _ = w.write_str("\nPANIC: ");
    if let Some(location) = info.location() {
        let _ = write!(w, "{}:{}: ", location.file(), location.line());
    }
    let _ = write!(w, "{}\n", info.message());

    if let Some(frame) = crate::trap::last_trap() {
        let _ = w.write_str("PANIC: last trap:\n");
        let _ = crate::trap::fmt_trap(&frame, &mut w);
    }
    crate::arch::aarch64::halt()
}
