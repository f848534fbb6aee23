// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! GICv2 distributor and CPU interface.

use core::fmt;

use crate::hal::{IrqCtl, Mmio};

pub const GICD_CTLR: usize = 0x000;
pub const GICD_TYPER: usize = 0x004;
pub const GICD_ISENABLER: usize = 0x100;
pub const GICD_ICENABLER: usize = 0x180;
pub const GICD_ICPENDR: usize = 0x280;
pub const GICD_IPRIORITYR: usize = 0x400;
pub const GICD_ITARGETSR: usize = 0x800;
pub const GICD_ICFGR: usize = 0xc00;

pub const GICC_CTLR: usize = 0x00;
pub const GICC_PMR: usize = 0x04;
pub const GICC_BPR: usize = 0x08;
pub const GICC_IAR: usize = 0x0c;
pub const GICC_EOIR: usize = 0x10;

/// Interrupt ids at or above this value are spurious and must not be completed.
pub const SPURIOUS_BASE: u32 = 1020;
const INTID_MASK: u32 = 0x3ff;
/// Lines below this are banked per core (SGIs and PPIs) and have no target register.
const FIRST_SPI: u32 = 32;
const MAX_LINES: u32 = 1020;

/// Priority programmed for every line we enable; must beat the PMR threshold.
pub const LINE_PRIORITY: u8 = 0x80;
const PMR_THRESHOLD: u32 = 0xf0;

/// Interrupt lines of the QEMU `virt` board that the kernel services.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqLine {
    /// Virtual generic timer PPI.
    Timer = 27,
    /// PL011 SPI.
    Uart = 33,
}

impl IrqLine {
    pub const fn id(self) -> u32 {
        self as u32
    }

    pub const fn from_id(id: u32) -> Option<Self> {
        match id {
            27 => Some(Self::Timer),
            33 => Some(Self::Uart),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GicError {
    /// Line number beyond what the distributor implements.
    InvalidLine(u32),
}

impl fmt::Display for GicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GicError::InvalidLine(id) => write!(f, "interrupt line {} not implemented", id),
        }
    }
}

/// Value read from GICC_IAR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Acknowledged(pub u32);

impl Acknowledged {
    pub const fn id(self) -> u32 {
        self.0 & INTID_MASK
    }

    pub const fn is_spurious(self) -> bool {
        self.id() >= SPURIOUS_BASE
    }
}

/// GICv2 with its two register windows.
pub struct Gic<D: Mmio, C: Mmio> {
    dist: D,
    cpu: C,
}

impl<D: Mmio, C: Mmio> Gic<D, C> {
    pub const fn new(dist: D, cpu: C) -> Self {
        Self { dist, cpu }
    }

    /// Number of lines the distributor implements (GICD_TYPER.ITLinesNumber).
    pub fn line_count(&self) -> u32 {
        // SAFETY: GICD_TYPER is a read-only register of the distributor.
        let typer = unsafe { self.dist.read32(GICD_TYPER) };
        (((typer & 0x1f) + 1) * 32).min(MAX_LINES)
    }

    /// Turns the distributor on with exactly `lines` enabled, prioritized and routed to core 0.
    pub fn init_distributor(&self, lines: &[IrqLine]) -> Result<(), GicError> {
        let implemented = self.line_count();
        for line in lines {
            if line.id() >= implemented {
                return Err(GicError::InvalidLine(line.id()));
            }
        }
        // SAFETY: offsets below are distributor registers within the mapped window.
        unsafe {
            self.dist.write32(GICD_CTLR, 0);
            for bank in 0..implemented.div_ceil(32) {
                self.dist.write32(GICD_ICENABLER + bank as usize * 4, u32::MAX);
                self.dist.write32(GICD_ICPENDR + bank as usize * 4, u32::MAX);
            }
            for line in lines {
                let id = line.id();
                self.set_priority(id, LINE_PRIORITY);
                if id >= FIRST_SPI {
                    self.set_target(id, 0x01);
                    // Level-sensitive.
                    let cfg = GICD_ICFGR + (id / 16) as usize * 4;
                    let shift = (id % 16) * 2;
                    let value = self.dist.read32(cfg) & !(0b11 << shift);
                    self.dist.write32(cfg, value);
                }
                self.dist.write32(GICD_ISENABLER + (id / 32) as usize * 4, 1 << (id % 32));
            }
            self.dist.write32(GICD_CTLR, 1);
        }
        Ok(())
    }

    /// Opens the CPU interface: priority mask, no preemption grouping, enabled.
    pub fn init_cpu_interface(&self) {
        // SAFETY: CPU interface registers within the mapped window.
        unsafe {
            self.cpu.write32(GICC_PMR, PMR_THRESHOLD);
            self.cpu.write32(GICC_BPR, 0);
            self.cpu.write32(GICC_CTLR, 1);
        }
    }

    pub fn acknowledge(&self) -> Acknowledged {
        // SAFETY: reading IAR is the architected acknowledge.
        Acknowledged(unsafe { self.cpu.read32(GICC_IAR) })
    }

    /// Completes an interrupt with the full IAR value it was acknowledged with.
    pub fn end_of_interrupt(&self, ack: Acknowledged) {
        if ack.is_spurious() {
            return;
        }
        // SAFETY: EOIR write with a value previously read from IAR.
        unsafe { self.cpu.write32(GICC_EOIR, ack.0) };
    }

    unsafe fn set_priority(&self, id: u32, priority: u8) {
        let reg = GICD_IPRIORITYR + (id / 4) as usize * 4;
        let shift = (id % 4) * 8;
        let value = (self.dist.read32(reg) & !(0xff << shift)) | ((priority as u32) << shift);
        self.dist.write32(reg, value);
    }

    unsafe fn set_target(&self, id: u32, mask: u8) {
        let reg = GICD_ITARGETSR + (id / 4) as usize * 4;
        let shift = (id % 4) * 8;
        let value = (self.dist.read32(reg) & !(0xff << shift)) | ((mask as u32) << shift);
        self.dist.write32(reg, value);
    }
}

impl<D: Mmio, C: Mmio> IrqCtl for Gic<D, C> {
    fn enable(&self, irq: u32) {
        // SAFETY: set-enable registers ignore writes of zero bits.
        unsafe { self.dist.write32(GICD_ISENABLER + (irq / 32) as usize * 4, 1 << (irq % 32)) };
    }

    fn disable(&self, irq: u32) {
        // SAFETY: clear-enable registers ignore writes of zero bits.
        unsafe { self.dist.write32(GICD_ICENABLER + (irq / 32) as usize * 4, 1 << (irq % 32)) };
    }
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate alloc;

    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use super::*;

    /// Register file that records every write.
    #[derive(Default)]
    pub(crate) struct MockMmio {
        pub regs: RefCell<BTreeMap<usize, u32>>,
        pub writes: RefCell<Vec<(usize, u32)>>,
    }

    impl MockMmio {
        pub fn with(reg: usize, value: u32) -> Self {
            let mock = Self::default();
            mock.regs.borrow_mut().insert(reg, value);
            mock
        }

        pub fn get(&self, reg: usize) -> u32 {
            self.regs.borrow().get(&reg).copied().unwrap_or(0)
        }
    }

    impl Mmio for MockMmio {
        unsafe fn write32(&self, offset: usize, value: u32) {
            self.regs.borrow_mut().insert(offset, value);
            self.writes.borrow_mut().push((offset, value));
        }

        unsafe fn read32(&self, offset: usize) -> u32 {
            self.get(offset)
        }
    }

    impl Gic<MockMmio, MockMmio> {
        pub fn cpu_writes(&self) -> Vec<(usize, u32)> {
            self.cpu.writes.borrow().clone()
        }
    }

    fn gic() -> Gic<MockMmio, MockMmio> {
        // ITLinesNumber = 2 -> 96 lines.
        Gic::new(MockMmio::with(GICD_TYPER, 2), MockMmio::default())
    }

    #[test]
    fn distributor_enables_exactly_requested_lines() {
        let gic = gic();
        gic.init_distributor(&[IrqLine::Timer, IrqLine::Uart]).expect("init");
        assert_eq!(gic.dist.get(GICD_ISENABLER), 1 << 27);
        assert_eq!(gic.dist.get(GICD_ISENABLER + 4), 1 << 1);
        assert_eq!(gic.dist.get(GICD_CTLR), 1);
        // Priority byte for line 27 lives in IPRIORITYR6, byte 3.
        assert_eq!(gic.dist.get(GICD_IPRIORITYR + 24) >> 24, LINE_PRIORITY as u32);
        // Line 33 routed to core 0.
        assert_eq!((gic.dist.get(GICD_ITARGETSR + 32) >> 8) & 0xff, 1);
        // Timer PPI has no target written.
        assert!(gic.dist.writes.borrow().iter().all(|(reg, _)| *reg != GICD_ITARGETSR + 24));
        // Distributor disabled first and enabled last.
        let writes = gic.dist.writes.borrow();
        assert_eq!(writes.first(), Some(&(GICD_CTLR, 0)));
        assert_eq!(writes.last(), Some(&(GICD_CTLR, 1)));
    }

    #[test]
    fn rejects_unimplemented_lines() {
        let gic = Gic::new(MockMmio::with(GICD_TYPER, 0), MockMmio::default());
        assert_eq!(gic.init_distributor(&[IrqLine::Uart]), Err(GicError::InvalidLine(33)));
    }

    #[test]
    fn cpu_interface_programming() {
        let gic = gic();
        gic.init_cpu_interface();
        assert_eq!(gic.cpu.get(GICC_PMR), PMR_THRESHOLD);
        assert_eq!(gic.cpu.get(GICC_BPR), 0);
        assert_eq!(gic.cpu.get(GICC_CTLR), 1);
        assert!(LINE_PRIORITY < PMR_THRESHOLD as u8);
    }

    #[test]
    fn spurious_ids_get_no_eoi() {
        let gic = gic();
        gic.end_of_interrupt(Acknowledged(1023));
        assert!(gic.cpu.writes.borrow().is_empty());
        let ack = Acknowledged((1 << 10) | 27);
        assert_eq!(ack.id(), 27);
        gic.end_of_interrupt(ack);
        assert_eq!(*gic.cpu.writes.borrow(), [(GICC_EOIR, (1 << 10) | 27)]);
    }
}
