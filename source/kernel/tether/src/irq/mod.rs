// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Interrupt routing for the two lines the kernel services
//! OWNERS: @kernel-team
//! PUBLIC API: init(), dispatch(iar, frame)
//! DEPENDS_ON: irq::gic, preempt (timer PPI), uart (device-ready SPI)
//! INVARIANTS: Every non-spurious id is completed exactly once with the value read from IAR

pub mod gic;

use crate::hal::virt::MmioWindow;
use crate::hal::Mmio;
use crate::mm::layout;
use crate::trap::TrapFrame;

pub use gic::{Acknowledged, Gic, GicError, IrqLine};

/// Lines enabled at boot; everything else stays masked at the distributor.
pub const SERVICED_LINES: [IrqLine; 2] = [IrqLine::Timer, IrqLine::Uart];

static GIC: Gic<MmioWindow, MmioWindow> =
    Gic::new(MmioWindow::new(layout::GIC_DIST.base), MmioWindow::new(layout::GIC_CPU.base));

/// Programs the distributor and CPU interface and unmasks the UART receive interrupt.
pub fn init() -> Result<(), GicError> {
    GIC.init_distributor(&SERVICED_LINES)?;
    GIC.init_cpu_interface();
    crate::uart::enable_rx_interrupt();
    Ok(())
}

/// Entry from the IRQ vector with the raw GICC_IAR value.
pub fn dispatch(iar: u32, frame: &mut TrapFrame) {
    dispatch_on(&GIC, Acknowledged(iar), frame, |line, frame| match line {
        IrqLine::Timer => crate::preempt::on_timer_irq(frame),
        IrqLine::Uart => crate::uart::on_rx_ready(),
    });
}

fn dispatch_on<D: Mmio, C: Mmio>(
    gic: &Gic<D, C>,
    ack: Acknowledged,
    frame: &mut TrapFrame,
    handle: impl FnOnce(IrqLine, &mut TrapFrame),
) {
    if ack.is_spurious() {
        return;
    }
    match IrqLine::from_id(ack.id()) {
        Some(line) => handle(line, frame),
        None => crate::log_warn!(target: "irq", "unexpected interrupt id={}", ack.id()),
    }
    gic.end_of_interrupt(ack);
}

#[cfg(test)]
mod tests {
    use super::gic::tests::MockMmio;
    use super::gic::GICC_EOIR;
    use super::*;

    fn mock() -> Gic<MockMmio, MockMmio> {
        Gic::new(MockMmio::default(), MockMmio::default())
    }

    #[test]
    fn routes_and_completes_known_lines() {
        let gic = mock();
        let mut frame = TrapFrame::default();
        let mut seen = None;
        dispatch_on(&gic, Acknowledged(33), &mut frame, |line, _| seen = Some(line));
        assert_eq!(seen, Some(IrqLine::Uart));
        assert_eq!(gic.cpu_writes(), [(GICC_EOIR, 33)]);
    }

    #[test]
    fn spurious_is_neither_handled_nor_completed() {
        let gic = mock();
        let mut frame = TrapFrame::default();
        let mut called = false;
        dispatch_on(&gic, Acknowledged(1023), &mut frame, |_, _| called = true);
        assert!(!called);
        assert!(gic.cpu_writes().is_empty());
    }

    #[test]
    fn unknown_lines_are_still_completed() {
        let gic = mock();
        let mut frame = TrapFrame::default();
        dispatch_on(&gic, Acknowledged(40), &mut frame, |_, _| panic!("no handler for 40"));
        assert_eq!(gic.cpu_writes(), [(GICC_EOIR, 40)]);
        assert!(crate::uart::host_sink::contains("unexpected interrupt id=40"));
    }
}
