// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: One-shot bring-up from `_start` to the hosted runtime
//! OWNERS: @kernel-team
//! PUBLIC API: kernel_entry(RuntimeEntry), RuntimeEntry, BootError
//! DEPENDS_ON: mm (address space, translation), sched (root context), trap (vectors),
//!             irq (GIC), timer/preempt (tick), loader (image handoff), selftest
//! INVARIANTS: Runs once on core 0 with IRQs masked until the GIC and vectors are live;
//!             every fixed region, both stacks included, is mapped before translation is on;
//!             any failure here is fatal and reported before halting

use core::fmt::{self, Write};

use crate::arch::aarch64;
use crate::hal::virt::VirtMmu;
use crate::irq::GicError;
use crate::loader::{self, ElfImage, KernelSink, LoadError, StackImage};
use crate::mm::{self, layout, AddressSpace, DemandWindow, FramePool, KernelSpace, MapError, RegionTables};
use crate::trap::TrapError;
use crate::{sched, uart};

/// What the kernel hands the core to once bring-up is done.
#[derive(Clone, Copy)]
pub enum RuntimeEntry {
    /// Runtime linked into the kernel image; its return value is the exit status.
    Direct(fn() -> i32),
    /// Standalone ELF executable, loaded and entered with a Linux startup stack.
    Image { elf: &'static [u8], argv: &'static [&'static str], envp: &'static [&'static str] },
}

/// Bring-up failures; all of them stop the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootError {
    Map(MapError),
    Vectors(TrapError),
    Gic(GicError),
    Load(LoadError),
}

impl From<MapError> for BootError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl From<TrapError> for BootError {
    fn from(value: TrapError) -> Self {
        Self::Vectors(value)
    }
}

impl From<GicError> for BootError {
    fn from(value: GicError) -> Self {
        Self::Gic(value)
    }
}

impl From<LoadError> for BootError {
    fn from(value: LoadError) -> Self {
        Self::Load(value)
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(err) => write!(f, "memory map: {}", err),
            Self::Vectors(err) => write!(f, "vectors: {}", err),
            Self::Gic(err) => write!(f, "interrupt controller: {}", err),
            Self::Load(err) => write!(f, "runtime image: {}", err),
        }
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
extern "C" {
    static mut __bss_start: u8;
    static mut __bss_end: u8;
}

/// Rust entry from `_start`, on the boot stack with the MMU off.
pub fn kernel_entry(entry: RuntimeEntry) -> ! {
    zero_bss();
    crate::init_heap();
    match bring_up() {
        Ok(()) => {}
        Err(err) => fail(err),
    }
    if let Err(err) = hand_off(entry) {
        fail(err);
    }
    aarch64::halt()
}

fn fail(err: BootError) -> ! {
    let mut u = uart::raw_writer();
    let _ = write!(u, "FATAL: boot: {}\n", err);
    aarch64::halt()
}

fn zero_bss() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // SAFETY: linker-provided bounds; nothing in .bss has been touched yet.
    unsafe {
        aarch64::clear_bss(core::ptr::addr_of_mut!(__bss_start), core::ptr::addr_of_mut!(__bss_end));
    }
}

/// Builds the boot address space with every fixed region identity mapped.
pub fn build_kernel_space() -> Result<KernelSpace, MapError> {
    // SAFETY: the page-table region is reserved in the memory map for this tree alone.
    let tables = unsafe { RegionTables::new(&layout::PAGE_TABLES) };
    let mut space = AddressSpace::new(
        tables,
        FramePool::from_region(&layout::FRAME_POOL),
        VirtMmu,
        DemandWindow::kernel(),
    )?;
    for region in layout::fixed_regions() {
        space.map_region(region)?;
    }
    Ok(space)
}

fn bring_up() -> Result<(), BootError> {
    #[cfg(feature = "boot_banner")]
    banner();

    let space = build_kernel_space()?;
    let root = space.root_address();
    let tables = space.table_pages();
    mm::install_kernel_space(space);
    // SAFETY: `root` identity maps the kernel image, both stacks and every device in use.
    unsafe { mm::enable_translation(root) };
    crate::log_info!(target: "boot", "translation on root={:#x} tables={}", root, tables);

    sched::install_root();

    let vbar = crate::trap::install()?;
    crate::log_info!(target: "boot", "vectors at {:#x}", vbar);

    crate::irq::init()?;

    #[cfg(feature = "timer_irq")]
    {
        crate::timer::start();
        crate::preempt::init();
        crate::log_info!(
            target: "boot",
            "tick {} ns quantum {} ns",
            crate::determinism::tick_period_ns(),
            crate::determinism::quantum_ns()
        );
    }
    aarch64::unmask_irqs();

    #[cfg(feature = "selftest")]
    crate::selftest::run();
    Ok(())
}

#[cfg(feature = "boot_banner")]
fn banner() {
    crate::log_info!(target: "boot", "tether on core {}", aarch64::core_id());
    for region in layout::MEMORY_MAP.iter() {
        crate::log_info!(
            target: "boot",
            "  {:<16} {:#012x}..{:#012x} {:?} {}",
            region.name,
            region.base,
            region.end(),
            region.class,
            region.perms
        );
    }
}

fn hand_off(entry: RuntimeEntry) -> Result<(), BootError> {
    match entry {
        RuntimeEntry::Direct(run) => {
            crate::log_info!(target: "boot", "entering linked runtime");
            let status = run();
            crate::log_info!(target: "boot", "runtime returned status={}", status);
            Ok(())
        }
        RuntimeEntry::Image { elf, argv, envp } => {
            let image = ElfImage::parse(elf)?;
            let entry = loader::load(&image, &mut KernelSink)?;
            let top = layout::BOOT_STACK.end();
            // SAFETY: `_start` keeps `sp` below the argument area, which is mapped
            // read-write as part of the boot stack and used by nothing else.
            let area = unsafe {
                core::slice::from_raw_parts_mut((top - layout::ARG_AREA) as *mut u8, layout::ARG_AREA)
            };
            let mut random = [0u8; 16];
            crate::syscall::Entropy::new().fill(&mut random, aarch64::counter(), area.as_ptr() as usize);
            let stack = StackImage::build(area, top, argv, envp, &image.aux_entries(), random)?;
            crate::log_info!(target: "boot", "entering image entry={:#x} sp={:#x}", entry, stack.sp);
            // SAFETY: every segment is loaded with final permissions and `stack` lives
            // in the argument area, which the runtime now owns.
            unsafe { loader::enter(entry, &stack) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_errors_render_their_source() {
        let err = BootError::from(GicError::InvalidLine(33));
        let mut out = alloc::string::String::new();
        let _ = write!(out, "{}", err);
        assert_eq!(out, "interrupt controller: interrupt line 33 not implemented");
        assert_eq!(BootError::from(LoadError::BadMagic), BootError::Load(LoadError::BadMagic));
    }
}
